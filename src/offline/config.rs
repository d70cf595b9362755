//! Engine configuration
//!
//! Defaults mirror the behaviour described for the queue, coordinator and
//! network monitor. Configuration can be persisted in the durable store and
//! overlaid from environment variables.

use serde::{Deserialize, Serialize};

use super::store::{QueueStore, CONFIG_KEY};

/// Queue sizing and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub dead_letter_limit: usize,
    pub cleanup_interval_ms: u64,
    /// Completed operations older than this are removed by cleanup
    pub completed_max_age_ms: u64,
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            dead_letter_limit: 100,
            cleanup_interval_ms: 5 * 60 * 1000,
            completed_max_age_ms: 60 * 60 * 1000,
            default_max_retries: 3,
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random widening, as a fraction of the delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Unjittered delay for the given retry count
    ///
    /// `min(initial * multiplier^(retry_count - 1), max)`; a retry count of
    /// zero is treated as the first retry.
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(1023) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }

    /// Delay with up to `jitter_ratio` random widening
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let base = self.base_delay_ms(retry_count);
        let jitter = base as f64 * self.jitter_ratio * rand::random::<f64>();
        base + jitter as u64
    }
}

/// Drain scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic sync interval; 0 disables the timer
    pub sync_interval_ms: u64,
    pub batch_size: usize,
    pub max_concurrent_operations: usize,
    pub enable_background_sync: bool,
    pub sync_on_foreground: bool,
    pub sync_on_reconnect: bool,
    /// Kick off a pass right after `enqueue` while online
    pub sync_on_enqueue: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            batch_size: 10,
            max_concurrent_operations: 3,
            enable_background_sync: false,
            sync_on_foreground: true,
            sync_on_reconnect: true,
            sync_on_enqueue: true,
        }
    }
}

/// Connectivity monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub initial_fetch_attempts: u32,
    /// Delay before attempt `n + 1` is `n * initial_fetch_delay_ms`
    pub initial_fetch_delay_ms: u64,
    pub reconnect_debounce_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            initial_fetch_attempts: 3,
            initial_fetch_delay_ms: 500,
            reconnect_debounce_ms: 1000,
        }
    }
}

/// Backend endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub sync: SyncConfig,
    pub network: NetworkConfig,
    pub api: ApiConfig,
}

impl OfflineConfig {
    /// Load configuration from the store, falling back to defaults
    pub fn load(store: &dyn QueueStore) -> Result<Self, ConfigError> {
        match store
            .get(CONFIG_KEY)
            .map_err(|e| ConfigError::Store(e.to_string()))?
        {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Persist configuration to the store
    pub fn save(&self, store: &dyn QueueStore) -> Result<(), ConfigError> {
        let json = serde_json::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        store
            .set(CONFIG_KEY, &json)
            .map_err(|e| ConfigError::Store(e.to_string()))
    }

    /// Defaults overlaid with `OFFLINE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OFFLINE_API_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(v) = lookup("OFFLINE_SYNC_INTERVAL_MS") {
            self.sync.sync_interval_ms = parse_var("OFFLINE_SYNC_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("OFFLINE_BATCH_SIZE") {
            self.sync.batch_size = parse_var("OFFLINE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("OFFLINE_MAX_CONCURRENT") {
            self.sync.max_concurrent_operations = parse_var("OFFLINE_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("OFFLINE_BACKGROUND_SYNC") {
            self.sync.enable_background_sync = parse_var("OFFLINE_BACKGROUND_SYNC", &v)?;
        }
        if let Some(v) = lookup("OFFLINE_MAX_QUEUE_SIZE") {
            self.queue.max_queue_size = parse_var("OFFLINE_MAX_QUEUE_SIZE", &v)?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.sync.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry multiplier must be >= 1, got {}",
                self.retry.multiplier
            )));
        }
        url::Url::parse(&self.api.base_url)
            .map_err(|e| ConfigError::Invalid(format!("api base_url: {}", e)))?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}={}", key, value)))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config store error: {0}")]
    Store(String),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
