//! Offline Service - composition root and public API
//!
//! Owns one queue, one network monitor and one coordinator, wires them to a
//! shared event bus and runs their background loops until `cleanup`.

use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{ConfigError, OfflineConfig};
use super::coordinator::{SyncCoordinator, SyncSummary};
use super::events::{EventBus, EventType, ListenerId, OfflineEvent};
use super::models::{
    EnqueueOptions, NetworkInfo, OperationType, QueueStats, QueuedOperation, SyncProgress,
    SyncTrigger,
};
use super::network::{AppLifecycleSource, ConnectivitySource, NetworkMonitor};
use super::processors::ProcessorRegistry;
use super::queue::{OperationQueue, QueueError};
use super::store::QueueStore;

/// Snapshot returned by `get_stats`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStats {
    pub queue: QueueStats,
    pub is_online: bool,
    pub is_syncing: bool,
    pub network: NetworkInfo,
    pub progress: SyncProgress,
    pub last_sync_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct OfflineService {
    config: OfflineConfig,
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
    coordinator: Arc<SyncCoordinator>,
    events: Arc<EventBus>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineService {
    /// Restore the queue, read the initial network state and start the
    /// background loops
    pub async fn start(
        config: OfflineConfig,
        store: Arc<dyn QueueStore>,
        registry: ProcessorRegistry,
        connectivity: Arc<dyn ConnectivitySource>,
        lifecycle: Arc<dyn AppLifecycleSource>,
    ) -> Result<Arc<Self>, ServiceError> {
        config.validate()?;
        if registry.is_empty() {
            log::warn!("Starting offline service with no processors registered");
        }

        let queue = Arc::new(OperationQueue::load(
            store,
            config.queue.clone(),
            config.retry.clone(),
        ));
        let events = Arc::new(EventBus::new());
        let (triggers, trigger_rx) = mpsc::unbounded_channel();

        let network = Arc::new(
            NetworkMonitor::initialize(
                config.network.clone(),
                &config.sync,
                connectivity.as_ref(),
                lifecycle.as_ref(),
                events.clone(),
                triggers.clone(),
            )
            .await,
        );

        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            network.clone(),
            Arc::new(registry),
            events.clone(),
            config.sync.clone(),
        ));

        let cancel = CancellationToken::new();
        let mut tasks = network.start(connectivity, lifecycle);
        tasks.push(queue.start_cleanup_timer(cancel.child_token()));
        tasks.push(tokio::spawn(
            coordinator.clone().run(trigger_rx, cancel.child_token()),
        ));

        // Work left over from the previous session
        if coordinator.can_sync() && !queue.get_ready_operations().is_empty() {
            let _ = triggers.send(SyncTrigger::Startup);
        }

        log::info!(
            "Offline service started (online: {}, queued: {})",
            network.is_online(),
            queue.get_queue_stats().total
        );

        Ok(Arc::new(Self {
            config,
            queue,
            network,
            coordinator,
            events,
            triggers,
            cancel,
            tasks: Mutex::new(tasks),
        }))
    }

    // ========================================================================
    // Queue Operations
    // ========================================================================

    /// Queue an operation and return its id
    pub fn enqueue(
        &self,
        op_type: OperationType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String, ServiceError> {
        let max_retries = options
            .max_retries
            .unwrap_or(self.config.queue.default_max_retries);
        let id = self
            .queue
            .enqueue(op_type, payload, options.priority, max_retries)?;

        if self.config.sync.sync_on_enqueue && self.coordinator.can_sync() {
            let _ = self.triggers.send(SyncTrigger::Enqueue);
        }
        Ok(id)
    }

    pub async fn force_sync(&self) -> Option<SyncSummary> {
        self.coordinator.force_sync().await
    }

    pub fn get_pending_operations(&self) -> Vec<QueuedOperation> {
        self.queue.get_pending_operations()
    }

    pub fn get_dead_letter_queue(&self) -> Vec<QueuedOperation> {
        self.queue.get_dead_letter_queue()
    }

    /// Requeue dead-lettered operations (all of them when `ids` is `None`),
    /// then force a sync; returns how many were requeued
    pub async fn retry_failed_operations(&self, ids: Option<&[String]>) -> usize {
        let targets: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => self
                .queue
                .get_dead_letter_queue()
                .into_iter()
                .map(|op| op.id)
                .collect(),
        };

        let mut requeued = 0;
        for id in &targets {
            match self.queue.requeue_from_dead_letter(id) {
                Ok(()) => requeued += 1,
                Err(e) => log::warn!("Cannot requeue {}: {}", id, e),
            }
        }

        if requeued > 0 {
            log::info!("Requeued {} dead-lettered operations", requeued);
            self.coordinator.force_sync().await;
        }
        requeued
    }

    pub fn clear_completed_operations(&self) -> usize {
        self.queue.clear_completed()
    }

    pub fn get_stats(&self) -> OfflineStats {
        OfflineStats {
            queue: self.queue.get_queue_stats(),
            is_online: self.network.is_online(),
            is_syncing: self.coordinator.is_syncing(),
            network: self.network.network_info(),
            progress: self.coordinator.sync_progress(),
            last_sync_at: self.coordinator.last_sync_at(),
        }
    }

    // ========================================================================
    // Events & State
    // ========================================================================

    pub fn add_event_listener<F>(&self, event_type: EventType, callback: F) -> ListenerId
    where
        F: Fn(&OfflineEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(event_type, callback)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.coordinator.is_syncing()
    }

    pub fn get_network_info(&self) -> NetworkInfo {
        self.network.network_info()
    }

    pub fn get_sync_progress(&self) -> SyncProgress {
        self.coordinator.sync_progress()
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop timers and subscriptions, then write the final queue state
    pub async fn cleanup(&self) -> Result<(), ServiceError> {
        log::info!("Shutting down offline service");
        self.cancel.cancel();
        self.network.stop();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for result in join_all(tasks).await {
            if let Err(e) = result {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }

        self.events.clear();
        self.queue.persist()?;
        log::info!("Offline service stopped");
        Ok(())
    }
}
