//! Sync Coordinator - decides when to drain the queue and drains it
//!
//! A drain pass walks the ready operations tier by tier (high, normal, low),
//! in batches of `batch_size`. Connectivity is re-checked before every batch,
//! and each batch runs in chunks of `max_concurrent_operations` that are
//! awaited as a whole before the next chunk starts. Only one pass runs at a
//! time; requests arriving while a pass is in flight are dropped.

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::SyncConfig;
use super::events::{EventBus, EventPayload};
use super::models::{now_millis, OperationStatus, Priority, QueuedOperation, SyncProgress, SyncTrigger};
use super::network::NetworkMonitor;
use super::processors::ProcessorRegistry;
use super::queue::OperationQueue;

/// Result of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Declined by their processor this pass, left pending without penalty
    pub skipped: usize,
    /// Connectivity was lost before every batch could run
    pub aborted: bool,
    pub duration_ms: u64,
}

/// How a single operation attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Skipped,
}

pub struct SyncCoordinator {
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
    registry: Arc<ProcessorRegistry>,
    events: Arc<EventBus>,
    config: SyncConfig,
    sync_in_progress: AtomicBool,
    progress: Mutex<SyncProgress>,
    last_sync_at: Mutex<Option<i64>>,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<OperationQueue>,
        network: Arc<NetworkMonitor>,
        registry: Arc<ProcessorRegistry>,
        events: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            network,
            registry,
            events,
            config,
            sync_in_progress: AtomicBool::new(false),
            progress: Mutex::new(SyncProgress::default()),
            last_sync_at: Mutex::new(None),
        }
    }

    fn progress(&self) -> MutexGuard<'_, SyncProgress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Gating
    // ========================================================================

    /// Online, and either foregrounded or allowed to sync in the background
    pub fn can_sync(&self) -> bool {
        self.network.is_online()
            && (self.network.is_foreground() || self.config.enable_background_sync)
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_in_progress.load(Ordering::SeqCst)
    }

    pub fn sync_progress(&self) -> SyncProgress {
        self.progress().clone()
    }

    /// Completion time of the last finished pass, in epoch millis
    pub fn last_sync_at(&self) -> Option<i64> {
        *self.last_sync_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Entry Points
    // ========================================================================

    /// Run a drain pass unless one is already running or syncing is not
    /// currently allowed; returns `None` when nothing ran
    pub async fn start_sync(&self, trigger: SyncTrigger) -> Option<SyncSummary> {
        if !self.can_sync() {
            log::debug!("Sync ({:?}) skipped: offline or backgrounded", trigger);
            return None;
        }
        self.run_exclusive(trigger, self.perform_sync(trigger)).await
    }

    /// Run `pass` under the single-flight flag
    ///
    /// A panic escaping the pass is reported as `sync_failed`; the flag and
    /// the progress state are reset either way.
    async fn run_exclusive<F>(&self, trigger: SyncTrigger, pass: F) -> Option<SyncSummary>
    where
        F: Future<Output = SyncSummary>,
    {
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Sync ({:?}) skipped: already in progress", trigger);
            return None;
        }

        let started = Instant::now();
        let result = AssertUnwindSafe(pass).catch_unwind().await;

        let summary = match result {
            Ok(summary) => summary,
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                log::error!("Sync pass aborted: {}", error);
                {
                    let mut progress = self.progress();
                    progress.in_progress = false;
                    progress.current_operation = None;
                }
                self.events.emit(EventPayload::SyncFailed {
                    error,
                    duration_ms: elapsed_ms(started),
                });
                SyncSummary {
                    aborted: true,
                    duration_ms: elapsed_ms(started),
                    ..SyncSummary::default()
                }
            }
        };

        self.sync_in_progress.store(false, Ordering::SeqCst);
        Some(summary)
    }

    /// Clear the in-progress flag and start a pass
    ///
    /// Lets a caller recover from a pass that never finished, at the cost of
    /// possibly overlapping it.
    pub async fn force_sync(&self) -> Option<SyncSummary> {
        if self.sync_in_progress.swap(false, Ordering::SeqCst) {
            log::warn!("Force sync overriding a pass still marked in progress");
        }
        self.start_sync(SyncTrigger::Manual).await
    }

    /// Serve sync triggers and the periodic timer until cancelled
    ///
    /// Each pass runs on its own task so a trigger arriving mid-pass is seen
    /// (and dropped) right away rather than queued behind it.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::UnboundedReceiver<SyncTrigger>,
        cancel: CancellationToken,
    ) {
        let mut ticker = if self.config.sync_interval_ms > 0 {
            let period = Duration::from_millis(self.config.sync_interval_ms);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        } else {
            None
        };

        log::info!(
            "Sync coordinator running (interval: {}ms)",
            self.config.sync_interval_ms
        );

        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut ticker) => SyncTrigger::Timer,
                received = triggers.recv() => match received {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                coordinator.start_sync(trigger).await;
            });
        }

        log::info!("Sync coordinator stopped");
    }

    // ========================================================================
    // Drain Pass
    // ========================================================================

    /// Drain every ready operation once
    pub async fn perform_sync(&self, trigger: SyncTrigger) -> SyncSummary {
        let started = Instant::now();
        let ready = self.queue.get_ready_operations();
        if ready.is_empty() {
            log::debug!("Sync ({:?}): nothing ready", trigger);
            return SyncSummary::default();
        }

        let total = ready.len();
        let batch_size = self.config.batch_size.max(1);
        let chunk_size = self.config.max_concurrent_operations.max(1);

        log::info!("Sync ({:?}) started: {} operations ready", trigger, total);
        *self.progress() = SyncProgress {
            total,
            in_progress: true,
            ..SyncProgress::default()
        };
        self.events.emit(EventPayload::SyncStarted {
            trigger,
            total,
            estimated_duration_ms: self.estimate_duration(&ready, chunk_size),
        });
        self.emit_progress();

        let mut summary = SyncSummary {
            total,
            ..SyncSummary::default()
        };

        'tiers: for tier in Priority::TIERS {
            let operations: Vec<QueuedOperation> = ready
                .iter()
                .filter(|op| op.priority == tier)
                .cloned()
                .collect();

            for batch in operations.chunks(batch_size) {
                if !self.can_sync() {
                    log::warn!("Connectivity lost mid-sync, remaining batches deferred");
                    summary.aborted = true;
                    break 'tiers;
                }

                for chunk in batch.chunks(chunk_size) {
                    let outcomes = join_all(chunk.iter().map(|op| self.process_operation(op))).await;
                    for outcome in outcomes {
                        match outcome {
                            Outcome::Completed => summary.completed += 1,
                            Outcome::Failed => summary.failed += 1,
                            Outcome::Skipped => summary.skipped += 1,
                        }
                    }
                }
            }
        }

        summary.duration_ms = elapsed_ms(started);
        {
            let mut progress = self.progress();
            progress.in_progress = false;
            progress.current_operation = None;
        }
        *self.last_sync_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now_millis());

        log::info!(
            "Sync ({:?}) finished in {}ms: {} completed, {} failed, {} skipped{}",
            trigger,
            summary.duration_ms,
            summary.completed,
            summary.failed,
            summary.skipped,
            if summary.aborted { " (aborted)" } else { "" }
        );

        self.emit_progress();
        self.events.emit(EventPayload::SyncCompleted {
            duration_ms: summary.duration_ms,
            completed: summary.completed,
            failed: summary.failed,
        });
        summary
    }

    /// Attempt one operation; a panic anywhere in the attempt counts as a
    /// failed attempt and never reaches sibling operations
    async fn process_operation(&self, op: &QueuedOperation) -> Outcome {
        match AssertUnwindSafe(self.attempt_operation(op)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = format!("Processor panicked: {}", panic_message(panic.as_ref()));
                self.record_failure(op, message)
            }
        }
    }

    async fn attempt_operation(&self, op: &QueuedOperation) -> Outcome {
        let Some(processor) = self.registry.get(&op.op_type) else {
            return self.record_failure(
                op,
                format!("No processor registered for operation type {}", op.op_type),
            );
        };

        if !processor.can_process(op) {
            log::debug!("Operation {} ({}) not processable yet, skipping", op.id, op.op_type);
            return Outcome::Skipped;
        }

        // Gone means it was dequeued or cleared since the pass started
        if let Err(e) = self
            .queue
            .update_operation_status(&op.id, OperationStatus::Processing, None)
        {
            log::warn!("Cannot start operation {}: {}", op.id, e);
            return Outcome::Skipped;
        }
        self.progress().current_operation = Some(op.id.clone());
        self.emit_progress();

        match processor.process(op).await {
            Ok(()) => self.record_success(op),
            Err(e) => self.record_failure(op, e.to_string()),
        }
    }

    fn record_success(&self, op: &QueuedOperation) -> Outcome {
        if let Err(e) = self
            .queue
            .update_operation_status(&op.id, OperationStatus::Completed, None)
        {
            log::warn!("Completed operation {} vanished from queue: {}", op.id, e);
        }
        log::info!("Operation {} ({}) completed", op.id, op.op_type);

        self.progress().completed += 1;
        let operation = self.queue.get_operation(&op.id).unwrap_or_else(|| op.clone());
        self.events.emit(EventPayload::OperationCompleted { operation });
        self.emit_progress();
        Outcome::Completed
    }

    fn record_failure(&self, op: &QueuedOperation, error: String) -> Outcome {
        log::warn!("Operation {} ({}) failed: {}", op.id, op.op_type, error);

        let status = match self.queue.update_operation_status(
            &op.id,
            OperationStatus::Failed,
            Some(error.clone()),
        ) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Failed operation {} vanished from queue: {}", op.id, e);
                OperationStatus::Failed
            }
        };

        let retry_delay_ms = if status == OperationStatus::DeadLetter {
            None
        } else {
            match self.queue.increment_retry_count(&op.id) {
                Ok(delay) => Some(delay),
                Err(e) => {
                    log::warn!("Cannot schedule retry for {}: {}", op.id, e);
                    None
                }
            }
        };

        self.progress().failed += 1;
        let operation = self
            .queue
            .get_operation(&op.id)
            .or_else(|| {
                self.queue
                    .get_dead_letter_queue()
                    .into_iter()
                    .find(|dead| dead.id == op.id)
            })
            .unwrap_or_else(|| op.clone());
        self.events.emit(EventPayload::OperationFailed {
            operation,
            error,
            will_retry: retry_delay_ms.is_some(),
            retry_delay_ms,
        });
        self.emit_progress();
        Outcome::Failed
    }

    fn emit_progress(&self) {
        let progress = self.sync_progress();
        self.events.emit(EventPayload::SyncProgress(progress));
    }

    /// Rough wall-clock estimate: processor estimates spread over the chunk width
    fn estimate_duration(&self, ready: &[QueuedOperation], chunk_size: usize) -> u64 {
        let sum: u64 = ready
            .iter()
            .filter_map(|op| {
                let processor = self.registry.get(&op.op_type)?;
                match catch_unwind(AssertUnwindSafe(|| processor.estimated_duration_ms(op))) {
                    Ok(estimate) => Some(estimate),
                    Err(_) => {
                        log::warn!("Duration estimate for {} ({}) panicked", op.id, op.op_type);
                        None
                    }
                }
            })
            .fold(0u64, u64::saturating_add);
        sum / chunk_size as u64
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::config::{NetworkConfig, QueueConfig, RetryPolicy};
    use crate::offline::events::EventType;
    use crate::offline::models::{ConnectionType, NetworkInfo, OperationType};
    use crate::offline::network::{AppState, ManualConnectivity, ManualLifecycle};
    use crate::offline::processors::{OperationProcessor, ProcessError};
    use crate::offline::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingProcessor {
        calls: AtomicUsize,
        fail: bool,
        decline: bool,
        delay_ms: u64,
        panic_in_estimate: bool,
    }

    #[async_trait]
    impl OperationProcessor for CountingProcessor {
        fn can_process(&self, _operation: &QueuedOperation) -> bool {
            !self.decline
        }

        async fn process(&self, _operation: &QueuedOperation) -> Result<(), ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                Err(ProcessError::Other("boom".into()))
            } else {
                Ok(())
            }
        }

        fn estimated_duration_ms(&self, _operation: &QueuedOperation) -> u64 {
            if self.panic_in_estimate {
                panic!("estimate unavailable");
            }
            100
        }
    }

    /// Panics while checking the operation named "bad"
    struct PanickingCheckProcessor;

    #[async_trait]
    impl OperationProcessor for PanickingCheckProcessor {
        fn can_process(&self, operation: &QueuedOperation) -> bool {
            if operation.payload["name"] == "bad" {
                panic!("precondition check bug");
            }
            true
        }

        async fn process(&self, _operation: &QueuedOperation) -> Result<(), ProcessError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }

        fn estimated_duration_ms(&self, _operation: &QueuedOperation) -> u64 {
            10
        }
    }

    struct Harness {
        coordinator: SyncCoordinator,
        queue: Arc<OperationQueue>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventBus>,
    }

    async fn harness(
        processor: Arc<dyn OperationProcessor>,
        app_state: AppState,
        config: SyncConfig,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryPolicy {
            initial_delay_ms: 0,
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };
        let queue = Arc::new(OperationQueue::load(store, QueueConfig::default(), retry));
        let events = Arc::new(EventBus::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let connectivity = ManualConnectivity::new(NetworkInfo::online(ConnectionType::Wifi));
        let lifecycle = ManualLifecycle::new(app_state);
        let network = Arc::new(
            NetworkMonitor::initialize(
                NetworkConfig::default(),
                &config,
                &connectivity,
                &lifecycle,
                events.clone(),
                tx,
            )
            .await,
        );

        let mut registry = ProcessorRegistry::new();
        registry.register([OperationType::ShareCreate], processor);

        Harness {
            coordinator: SyncCoordinator::new(
                queue.clone(),
                network.clone(),
                Arc::new(registry),
                events.clone(),
                config,
            ),
            queue,
            network,
            events,
        }
    }

    fn enqueue(queue: &OperationQueue, op_type: OperationType) -> String {
        queue
            .enqueue(op_type, json!({}), Priority::Normal, 3)
            .unwrap()
    }

    #[tokio::test]
    async fn test_can_sync_gating() {
        let processor = Arc::new(CountingProcessor::default());
        let h = harness(processor.clone(), AppState::Background, SyncConfig::default()).await;
        assert!(!h.coordinator.can_sync());

        h.network.handle_app_state_change(AppState::Active);
        assert!(h.coordinator.can_sync());

        let mut captive = NetworkInfo::online(ConnectionType::Wifi);
        captive.is_internet_reachable = Some(false);
        h.network.handle_network_change(captive);
        assert!(!h.coordinator.can_sync());

        let background = SyncConfig {
            enable_background_sync: true,
            ..SyncConfig::default()
        };
        let h = harness(processor, AppState::Background, background).await;
        assert!(h.coordinator.can_sync());
    }

    #[tokio::test]
    async fn test_empty_queue_emits_nothing() {
        let h = harness(
            Arc::new(CountingProcessor::default()),
            AppState::Active,
            SyncConfig::default(),
        )
        .await;
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        h.events.add_listener(EventType::SyncStarted, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let summary = h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert!(!h.coordinator.is_syncing());
    }

    #[tokio::test]
    async fn test_offline_start_is_noop() {
        let processor = Arc::new(CountingProcessor::default());
        let h = harness(processor.clone(), AppState::Active, SyncConfig::default()).await;
        enqueue(&h.queue, OperationType::ShareCreate);
        h.network.handle_network_change(NetworkInfo::offline_unknown());

        assert!(h.coordinator.start_sync(SyncTrigger::Manual).await.is_none());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.get_pending_operations().len(), 1);
    }

    #[tokio::test]
    async fn test_decline_is_skipped_without_penalty() {
        let processor = Arc::new(CountingProcessor {
            decline: true,
            ..CountingProcessor::default()
        });
        let h = harness(processor.clone(), AppState::Active, SyncConfig::default()).await;
        let id = enqueue(&h.queue, OperationType::ShareCreate);

        let summary = h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        let op = h.queue.get_operation(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_processor_consumes_retry() {
        let h = harness(
            Arc::new(CountingProcessor::default()),
            AppState::Active,
            SyncConfig::default(),
        )
        .await;
        let id = enqueue(&h.queue, OperationType::NfcWrite);

        let summary = h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(summary.failed, 1);

        let op = h.queue.get_operation(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 1);
        assert!(op.error_message.unwrap().contains("No processor"));
    }

    #[tokio::test]
    async fn test_failure_event_reports_retry() {
        let processor = Arc::new(CountingProcessor {
            fail: true,
            ..CountingProcessor::default()
        });
        let h = harness(processor, AppState::Active, SyncConfig::default()).await;
        enqueue(&h.queue, OperationType::ShareCreate);

        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = failures.clone();
        h.events.add_listener(EventType::OperationFailed, move |event| {
            if let EventPayload::OperationFailed { will_retry, operation, .. } = &event.payload {
                f.lock().unwrap().push((*will_retry, operation.retry_count));
            }
        });

        h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(*failures.lock().unwrap(), vec![(true, 1)]);

        let progress = h.coordinator.sync_progress();
        assert_eq!(progress.failed, 1);
        assert!(!progress.in_progress);
        assert!(h.coordinator.last_sync_at().is_some());
    }

    #[tokio::test]
    async fn test_panicking_check_does_not_strand_siblings() {
        let h = harness(
            Arc::new(PanickingCheckProcessor),
            AppState::Active,
            SyncConfig::default(),
        )
        .await;
        let good = h
            .queue
            .enqueue(OperationType::ShareCreate, json!({ "name": "good" }), Priority::Normal, 2)
            .unwrap();
        let bad = h
            .queue
            .enqueue(OperationType::ShareCreate, json!({ "name": "bad" }), Priority::Normal, 2)
            .unwrap();

        let summary = h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert!(!summary.aborted);
        assert_eq!((summary.completed, summary.failed), (1, 1));
        assert_eq!(
            h.queue.get_operation(&good).unwrap().status,
            OperationStatus::Completed
        );

        let op = h.queue.get_operation(&bad).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 1);
        assert!(op.error_message.unwrap().contains("precondition check bug"));

        // Keeps consuming retries until it is dead-lettered
        for _ in 0..2 {
            h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        }
        assert!(h.queue.get_operation(&bad).is_none());
        assert_eq!(h.queue.get_dead_letter_queue()[0].id, bad);
        assert!(h.queue.get_ready_operations().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_estimate_does_not_abort_pass() {
        let processor = Arc::new(CountingProcessor {
            panic_in_estimate: true,
            ..CountingProcessor::default()
        });
        let h = harness(processor.clone(), AppState::Active, SyncConfig::default()).await;
        enqueue(&h.queue, OperationType::ShareCreate);

        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        h.events.add_listener(EventType::SyncFailed, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let summary = h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    async fn corrupted_pass() -> SyncSummary {
        panic!("queue state corrupted")
    }

    #[tokio::test]
    async fn test_escaping_fault_emits_sync_failed() {
        let h = harness(
            Arc::new(CountingProcessor::default()),
            AppState::Active,
            SyncConfig::default(),
        )
        .await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        h.events.add_listener(EventType::SyncFailed, move |event| {
            if let EventPayload::SyncFailed { error, .. } = &event.payload {
                e.lock().unwrap().push(error.clone());
            }
        });
        h.coordinator.progress().in_progress = true;

        let summary = h
            .coordinator
            .run_exclusive(SyncTrigger::Manual, corrupted_pass())
            .await
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(*errors.lock().unwrap(), vec!["queue state corrupted".to_string()]);
        assert!(!h.coordinator.is_syncing());
        assert!(!h.coordinator.sync_progress().in_progress);

        // The flag was released, so the next pass runs normally
        enqueue(&h.queue, OperationType::ShareCreate);
        let summary = h.coordinator.start_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_start_runs_once() {
        let processor = Arc::new(CountingProcessor {
            delay_ms: 30,
            ..CountingProcessor::default()
        });
        let h = harness(processor.clone(), AppState::Active, SyncConfig::default()).await;
        enqueue(&h.queue, OperationType::ShareCreate);

        let (first, second) = tokio::join!(
            h.coordinator.start_sync(SyncTrigger::Manual),
            h.coordinator.start_sync(SyncTrigger::Timer)
        );
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_sync_overrides_stuck_flag() {
        let processor = Arc::new(CountingProcessor::default());
        let h = harness(processor.clone(), AppState::Active, SyncConfig::default()).await;
        enqueue(&h.queue, OperationType::ShareCreate);

        h.coordinator.sync_in_progress.store(true, Ordering::SeqCst);
        assert!(h.coordinator.start_sync(SyncTrigger::Timer).await.is_none());

        let summary = h.coordinator.force_sync().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(!h.coordinator.is_syncing());
    }

    #[tokio::test]
    async fn test_run_loop_serves_triggers() {
        let processor = Arc::new(CountingProcessor::default());
        let config = SyncConfig {
            sync_interval_ms: 0,
            ..SyncConfig::default()
        };
        let h = harness(processor.clone(), AppState::Active, config).await;
        let id = enqueue(&h.queue, OperationType::ShareCreate);

        let coordinator = Arc::new(h.coordinator);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.clone().run(rx, cancel.clone()));

        tx.send(SyncTrigger::Enqueue).unwrap();
        for _ in 0..100 {
            if processor.calls.load(Ordering::SeqCst) > 0 && !coordinator.is_syncing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            h.queue.get_operation(&id).unwrap().status,
            OperationStatus::Completed
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
