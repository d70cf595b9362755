//! Offline Data Models
//!
//! Data Categories:
//! - QueuedOperation: unit of durable work and its state machine fields
//! - NetworkInfo: current connectivity snapshot (transient)
//! - SyncProgress: state of the drain pass in flight (transient)
//! - QueueStats: per-status counts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Operation Type
// ============================================================================

/// Kind of work an operation carries; selects the processor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OperationType {
    AutomationExecute,
    ShareCreate,
    NfcWrite,
    QrGenerate,
    AutomationCreate,
    AutomationUpdate,
    AutomationDelete,
    DeploymentCreate,
    /// Free-form backend call, tagged `api_<name>`
    Api(String),
}

impl OperationType {
    pub fn as_str(&self) -> String {
        match self {
            Self::AutomationExecute => "automation_execute".to_string(),
            Self::ShareCreate => "share_create".to_string(),
            Self::NfcWrite => "nfc_write".to_string(),
            Self::QrGenerate => "qr_generate".to_string(),
            Self::AutomationCreate => "automation_create".to_string(),
            Self::AutomationUpdate => "automation_update".to_string(),
            Self::AutomationDelete => "automation_delete".to_string(),
            Self::DeploymentCreate => "deployment_create".to_string(),
            Self::Api(name) => format!("api_{}", name),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "automation_execute" => Ok(Self::AutomationExecute),
            "share_create" => Ok(Self::ShareCreate),
            "nfc_write" => Ok(Self::NfcWrite),
            "qr_generate" => Ok(Self::QrGenerate),
            "automation_create" => Ok(Self::AutomationCreate),
            "automation_update" => Ok(Self::AutomationUpdate),
            "automation_delete" => Ok(Self::AutomationDelete),
            "deployment_create" => Ok(Self::DeploymentCreate),
            other => match other.strip_prefix("api_") {
                Some(name) if !name.is_empty() => Ok(Self::Api(name.to_string())),
                _ => Err(format!("Invalid operation type: {}", s)),
            },
        }
    }

    pub fn is_api(&self) -> bool {
        matches!(self, Self::Api(_))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl TryFrom<String> for OperationType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OperationType> for String {
    fn from(value: OperationType) -> Self {
        value.as_str()
    }
}

// ============================================================================
// Priority & Status
// ============================================================================

/// Drain priority; `High` drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Tiers in drain order
    pub const TIERS: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Operation state machine
///
/// `pending -> processing -> {completed | failed}`, `failed -> pending` on
/// retry, `failed -> dead_letter` once retries are exhausted, and
/// `dead_letter -> pending` on manual requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

// ============================================================================
// Queued Operation
// ============================================================================

/// Unit of durable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub payload: serde_json::Value,
    /// Enqueue time, replaced by the completion time once completed
    pub timestamp: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl QueuedOperation {
    /// Create a new pending operation with a fresh id
    pub fn new(
        op_type: OperationType,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            payload,
            timestamp: now_millis(),
            retry_count: 0,
            max_retries,
            priority,
            status: OperationStatus::Pending,
            last_retry_timestamp: None,
            error_message: None,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Options accepted by `enqueue`
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Falls back to the queue's configured default when `None`
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            max_retries: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

// ============================================================================
// Network Info
// ============================================================================

/// Connection medium reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Bluetooth,
    Vpn,
    Other,
    Unknown,
    None,
}

/// Connectivity snapshot, written only by the network monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub is_connected: bool,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    /// `None` while reachability is unknown
    pub is_internet_reachable: Option<bool>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl NetworkInfo {
    /// Fallback state used when the platform cannot be queried
    pub fn offline_unknown() -> Self {
        Self {
            is_connected: false,
            connection_type: ConnectionType::Unknown,
            is_internet_reachable: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_connected: true,
            connection_type,
            is_internet_reachable: Some(true),
            details: serde_json::Value::Null,
        }
    }

    /// Connected, and reachability not explicitly denied
    pub fn is_usable(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }

    /// Whether `other` differs in any field that matters for syncing
    pub fn differs_from(&self, other: &NetworkInfo) -> bool {
        self.is_connected != other.is_connected
            || self.connection_type != other.connection_type
            || self.is_internet_reachable != other.is_internet_reachable
    }
}

// ============================================================================
// Progress & Stats
// ============================================================================

/// What asked for a drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    Timer,
    NetworkRestored,
    AppForeground,
    Enqueue,
    Manual,
}

/// Progress of the current (or last) drain pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: bool,
    pub current_operation: Option<String>,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub total: usize,
}
