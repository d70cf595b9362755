//! Typed publish/subscribe for engine lifecycle events
//!
//! Listeners are plain callbacks registered per event type. A panicking
//! listener is logged and skipped; it never affects other listeners or the
//! component that emitted the event.

use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::models::{now_millis, NetworkInfo, QueuedOperation, SyncProgress, SyncTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NetworkChanged,
    SyncStarted,
    SyncProgress,
    SyncCompleted,
    SyncFailed,
    OperationCompleted,
    OperationFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    NetworkChanged {
        info: NetworkInfo,
        previous: NetworkInfo,
    },
    SyncStarted {
        trigger: SyncTrigger,
        total: usize,
        estimated_duration_ms: u64,
    },
    SyncProgress(SyncProgress),
    SyncCompleted {
        duration_ms: u64,
        completed: usize,
        failed: usize,
    },
    SyncFailed {
        error: String,
        duration_ms: u64,
    },
    OperationCompleted {
        operation: QueuedOperation,
    },
    OperationFailed {
        operation: QueuedOperation,
        error: String,
        /// False once the operation has been dead-lettered
        will_retry: bool,
        retry_delay_ms: Option<u64>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::NetworkChanged { .. } => EventType::NetworkChanged,
            Self::SyncStarted { .. } => EventType::SyncStarted,
            Self::SyncProgress(_) => EventType::SyncProgress,
            Self::SyncCompleted { .. } => EventType::SyncCompleted,
            Self::SyncFailed { .. } => EventType::SyncFailed,
            Self::OperationCompleted { .. } => EventType::OperationCompleted,
            Self::OperationFailed { .. } => EventType::OperationFailed,
        }
    }
}

/// Event as delivered to listeners
#[derive(Debug, Clone, Serialize)]
pub struct OfflineEvent {
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl OfflineEvent {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

pub type Listener = Arc<dyn Fn(&OfflineEvent) + Send + Sync>;

/// Handle returned by `add_listener`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<EventType, Vec<(ListenerId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, event_type: EventType, callback: F) -> ListenerId
    where
        F: Fn(&OfflineEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the listener was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(lid, _)| *lid == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(&event_type).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.clear();
    }

    /// Deliver an event to every listener of its type
    pub fn emit(&self, payload: EventPayload) {
        let event = OfflineEvent {
            timestamp: now_millis(),
            payload,
        };
        let event_type = event.event_type();

        // Snapshot so listeners may (un)subscribe while being called
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            match listeners.get(&event_type) {
                Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::error!("Event listener for {:?} panicked", event_type);
            }
        }
    }
}
