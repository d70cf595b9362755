//! Network Monitor - single source of truth for connectivity and app state
//!
//! Subscribes to a connectivity source and an app lifecycle source, keeps
//! the current `NetworkInfo` / `AppState`, emits `network_changed` events
//! and asks the sync coordinator for a pass when:
//! - the device comes back online (after a short debounce)
//! - the app returns to the foreground

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{NetworkConfig, SyncConfig};
use super::events::{EventBus, EventPayload};
use super::models::{ConnectionType, NetworkInfo, SyncTrigger};

// ============================================================================
// Sources
// ============================================================================

/// Application lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Active,
    Background,
    Inactive,
}

/// Platform connectivity service
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    /// Current snapshot; may fail while the platform service starts up
    async fn fetch(&self) -> Result<NetworkInfo, NetworkError>;

    fn subscribe(&self) -> broadcast::Receiver<NetworkInfo>;
}

/// Platform foreground/background notifications
pub trait AppLifecycleSource: Send + Sync {
    fn current(&self) -> AppState;

    fn subscribe(&self) -> broadcast::Receiver<AppState>;
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Connectivity service not ready")]
    NotReady,

    #[error("Connectivity query failed: {0}")]
    Query(String),
}

/// Connectivity source fed by the host application
pub struct ManualConnectivity {
    info: RwLock<NetworkInfo>,
    sender: broadcast::Sender<NetworkInfo>,
    failing_fetches: AtomicU32,
}

impl ManualConnectivity {
    pub fn new(initial: NetworkInfo) -> Self {
        let (sender, _) = broadcast::channel(32);
        Self {
            info: RwLock::new(initial),
            sender,
            failing_fetches: AtomicU32::new(0),
        }
    }

    /// Record a platform callback and notify subscribers
    pub fn set(&self, info: NetworkInfo) {
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = info.clone();
        // No subscribers yet is fine
        let _ = self.sender.send(info);
    }

    pub fn set_connected(&self, connection_type: ConnectionType) {
        self.set(NetworkInfo::online(connection_type));
    }

    pub fn set_offline(&self) {
        self.set(NetworkInfo {
            is_connected: false,
            connection_type: ConnectionType::None,
            is_internet_reachable: Some(false),
            details: serde_json::Value::Null,
        });
    }

    /// Make the next `count` fetches fail with `NotReady`
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivitySource for ManualConnectivity {
    async fn fetch(&self) -> Result<NetworkInfo, NetworkError> {
        let remaining = self.failing_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(NetworkError::NotReady);
        }
        Ok(self.info.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkInfo> {
        self.sender.subscribe()
    }
}

/// App lifecycle source fed by the host application
pub struct ManualLifecycle {
    state: RwLock<AppState>,
    sender: broadcast::Sender<AppState>,
}

impl ManualLifecycle {
    pub fn new(initial: AppState) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(initial),
            sender,
        }
    }

    pub fn set(&self, state: AppState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        let _ = self.sender.send(state);
    }
}

impl AppLifecycleSource for ManualLifecycle {
    fn current(&self) -> AppState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self) -> broadcast::Receiver<AppState> {
        self.sender.subscribe()
    }
}

// ============================================================================
// Monitor
// ============================================================================

pub struct NetworkMonitor {
    config: NetworkConfig,
    sync_on_reconnect: bool,
    sync_on_foreground: bool,
    info: RwLock<NetworkInfo>,
    app_state: RwLock<AppState>,
    events: Arc<EventBus>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    cancel: CancellationToken,
    /// Timer of the reconnect trigger not yet sent
    pending_reconnect: Mutex<Option<CancellationToken>>,
}

impl NetworkMonitor {
    /// Build the monitor with its initial state
    ///
    /// Connectivity is fetched with retries; if every attempt fails the
    /// monitor starts from an offline/unknown snapshot.
    pub async fn initialize(
        config: NetworkConfig,
        sync_config: &SyncConfig,
        connectivity: &dyn ConnectivitySource,
        lifecycle: &dyn AppLifecycleSource,
        events: Arc<EventBus>,
        triggers: mpsc::UnboundedSender<SyncTrigger>,
    ) -> Self {
        let info = fetch_initial_state(&config, connectivity).await;
        log::info!(
            "Initial network state: connected={}, type={:?}, reachable={:?}",
            info.is_connected,
            info.connection_type,
            info.is_internet_reachable
        );

        Self {
            config,
            sync_on_reconnect: sync_config.sync_on_reconnect,
            sync_on_foreground: sync_config.sync_on_foreground,
            info: RwLock::new(info),
            app_state: RwLock::new(lifecycle.current()),
            events,
            triggers,
            cancel: CancellationToken::new(),
            pending_reconnect: Mutex::new(None),
        }
    }

    /// Subscribe to both sources and process their notifications until
    /// `stop` is called
    pub fn start(
        self: &Arc<Self>,
        connectivity: Arc<dyn ConnectivitySource>,
        lifecycle: Arc<dyn AppLifecycleSource>,
    ) -> Vec<JoinHandle<()>> {
        let mut network_rx = connectivity.subscribe();
        let monitor = Arc::clone(self);
        let network_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    received = network_rx.recv() => match received {
                        Ok(info) => {
                            monitor.handle_network_change(info);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Missed {} connectivity notifications", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            log::debug!("Connectivity subscription closed");
        });

        let mut app_rx = lifecycle.subscribe();
        let monitor = Arc::clone(self);
        let app_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    received = app_rx.recv() => match received {
                        Ok(state) => monitor.handle_app_state_change(state),
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            // Only the latest state matters
                            let current = lifecycle.current();
                            monitor.handle_app_state_change(current);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            log::debug!("App lifecycle subscription closed");
        });

        vec![network_task, app_task]
    }

    /// Cancel subscriptions and any pending debounced trigger
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Apply a connectivity notification; returns whether it changed anything
    pub fn handle_network_change(&self, info: NetworkInfo) -> bool {
        let previous = {
            let mut current = self.info.write().unwrap_or_else(|e| e.into_inner());
            if !current.differs_from(&info) {
                return false;
            }
            std::mem::replace(&mut *current, info.clone())
        };

        log::info!(
            "Network changed: connected={} type={:?} reachable={:?}",
            info.is_connected,
            info.connection_type,
            info.is_internet_reachable
        );

        let restored = !previous.is_usable() && info.is_usable();
        if previous.is_usable() && !info.is_usable() {
            self.cancel_reconnect_sync();
        }

        self.events.emit(EventPayload::NetworkChanged {
            info,
            previous,
        });

        if restored && self.sync_on_reconnect {
            self.schedule_reconnect_sync();
        }
        true
    }

    /// (Re)start the debounce timer; only the last restore within the
    /// window sends a trigger
    fn schedule_reconnect_sync(&self) {
        let debounce = Duration::from_millis(self.config.reconnect_debounce_ms);
        let triggers = self.triggers.clone();
        let timer = self.cancel.child_token();

        if let Some(previous) = self
            .pending_reconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(timer.clone())
        {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    log::info!("Connection restored, requesting sync");
                    let _ = triggers.send(SyncTrigger::NetworkRestored);
                }
            }
        });
    }

    fn cancel_reconnect_sync(&self) {
        if let Some(timer) = self
            .pending_reconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            log::debug!("Connection lost, dropping pending reconnect sync");
            timer.cancel();
        }
    }

    /// Apply an app lifecycle notification
    pub fn handle_app_state_change(&self, state: AppState) {
        let previous = {
            let mut current = self.app_state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, state)
        };
        if previous == state {
            return;
        }

        log::debug!("App state changed: {:?} -> {:?}", previous, state);

        if state == AppState::Active && self.sync_on_foreground {
            log::info!("App entered foreground, requesting sync");
            let _ = self.triggers.send(SyncTrigger::AppForeground);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn network_info(&self) -> NetworkInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.info.read().unwrap_or_else(|e| e.into_inner()).is_connected
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.info.read().unwrap_or_else(|e| e.into_inner()).connection_type
    }

    pub fn is_internet_reachable(&self) -> Option<bool> {
        self.info.read().unwrap_or_else(|e| e.into_inner()).is_internet_reachable
    }

    /// Connected and not known to be unreachable
    pub fn is_online(&self) -> bool {
        self.info.read().unwrap_or_else(|e| e.into_inner()).is_usable()
    }

    pub fn app_state(&self) -> AppState {
        *self.app_state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_foreground(&self) -> bool {
        self.app_state() == AppState::Active
    }
}

async fn fetch_initial_state(
    config: &NetworkConfig,
    connectivity: &dyn ConnectivitySource,
) -> NetworkInfo {
    let attempts = config.initial_fetch_attempts.max(1);

    for attempt in 1..=attempts {
        match connectivity.fetch().await {
            Ok(info) => return info,
            Err(e) => {
                log::warn!(
                    "Network state fetch failed (attempt {}/{}): {}",
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    let delay = config.initial_fetch_delay_ms * attempt as u64;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    log::warn!("Falling back to offline state after {} attempts", attempts);
    NetworkInfo::offline_unknown()
}

// ============================================================================
// Tests
// ============================================================================
