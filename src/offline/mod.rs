//! Offline Module - Durable Operation Queue & Sync Engine
//!
//! Lets the application keep working without connectivity:
//! - Operations are queued durably with a priority and a retry budget
//! - Connectivity and foreground state are monitored continuously
//! - The queue is drained when conditions allow, with bounded concurrency
//! - Failed operations back off exponentially, then move to a dead-letter archive
//!
//! Architecture:
//! - `OperationQueue`: single writer of the persisted queue
//! - `NetworkMonitor`: single writer of connectivity state
//! - `SyncCoordinator`: drain passes, one at a time
//! - `ProcessorRegistry`: operation type -> backend call
//! - `OfflineService`: composition root exposing the public API

pub mod api;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod models;
pub mod network;
pub mod processors;
pub mod queue;
pub mod service;
pub mod store;


// Re-export commonly used types
pub use api::{ApiError, BackendClient, TokenProvider, TokenStore};
pub use config::{
    ApiConfig, ConfigError, NetworkConfig, OfflineConfig, QueueConfig, RetryPolicy, SyncConfig,
};
pub use coordinator::{SyncCoordinator, SyncSummary};
pub use events::{EventBus, EventPayload, EventType, ListenerId, OfflineEvent};
pub use models::{
    ConnectionType, EnqueueOptions, NetworkInfo, OperationStatus, OperationType, Priority,
    QueueStats, QueuedOperation, SyncProgress, SyncTrigger,
};
pub use network::{
    AppLifecycleSource, AppState, ConnectivitySource, ManualConnectivity, ManualLifecycle,
    NetworkError, NetworkMonitor,
};
pub use processors::{default_registry, Backend, OperationProcessor, ProcessError, ProcessorRegistry};
pub use queue::{OperationQueue, QueueError};
pub use service::{OfflineService, OfflineStats, ServiceError};
pub use store::{MemoryStore, QueueStore, StoreError};
