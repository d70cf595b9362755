//! Operation Queue - durable, priority-ordered storage of pending work
//!
//! Operations are kept in memory, sorted by priority (stable within a
//! priority), and written through to the durable store after every
//! mutation. Operations that exhaust their retry budget move to a separate,
//! bounded dead-letter archive.
//!
//! Features:
//! - Priority ordering enforced at insertion
//! - Exponential backoff with jitter between retries
//! - Dead-letter archive (most recent entries kept, oldest evicted)
//! - Periodic cleanup of old completed operations
//! - In-memory state stays authoritative when a store write fails

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{QueueConfig, RetryPolicy};
use super::models::{
    now_millis, OperationStatus, OperationType, Priority, QueueStats, QueuedOperation,
};
use super::store::{QueueStore, DEAD_LETTER_KEY, QUEUE_KEY};

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    operations: Vec<QueuedOperation>,
    dead_letter: Vec<QueuedOperation>,
    /// Delay chosen by the last `increment_retry_count`, keyed by id
    retry_delays: std::collections::HashMap<String, u64>,
    queue_dirty: bool,
    dead_letter_dirty: bool,
}

/// Priority-ordered operation queue backed by a `QueueStore`
pub struct OperationQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
}

impl OperationQueue {
    /// Restore the queue and dead-letter archive from the store
    pub fn load(store: Arc<dyn QueueStore>, config: QueueConfig, retry: RetryPolicy) -> Self {
        let mut operations = read_list(store.as_ref(), QUEUE_KEY);
        let dead_letter = read_list(store.as_ref(), DEAD_LETTER_KEY);

        // Anything that was mid-flight when the process died goes back to pending
        for op in operations.iter_mut() {
            if op.status == OperationStatus::Processing {
                op.status = OperationStatus::Pending;
            }
        }
        operations.sort_by_key(|op| op.priority);

        log::info!(
            "Operation queue loaded: {} queued, {} dead-lettered",
            operations.len(),
            dead_letter.len()
        );

        Self {
            store,
            config,
            retry,
            state: Mutex::new(QueueState {
                operations,
                dead_letter,
                ..QueueState::default()
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Enqueue / Dequeue
    // ========================================================================

    /// Add an operation, returning its id
    ///
    /// A full queue first drops old completed operations; if it is still
    /// full the call fails with `QueueError::QueueFull`.
    pub fn enqueue(
        &self,
        op_type: OperationType,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
    ) -> Result<String, QueueError> {
        let mut state = self.lock();

        if state.operations.len() >= self.config.max_queue_size {
            let removed = self.remove_old_completed(&mut state);
            if removed > 0 {
                log::info!("Queue full, evicted {} old completed operations", removed);
            }
            if state.operations.len() >= self.config.max_queue_size {
                log::warn!(
                    "Rejecting {} operation: queue full ({} entries)",
                    op_type,
                    state.operations.len()
                );
                return Err(QueueError::QueueFull {
                    max_size: self.config.max_queue_size,
                });
            }
        }

        let op = QueuedOperation::new(op_type, payload, priority, max_retries);
        let id = op.id.clone();
        log::info!("Enqueued {} operation {} ({})", op.op_type, id, priority.as_str());

        insert_by_priority(&mut state.operations, op);
        state.queue_dirty = true;
        self.flush(&mut state);

        Ok(id)
    }

    /// Remove and return an operation from the main queue
    pub fn dequeue(&self, id: &str) -> Option<QueuedOperation> {
        let mut state = self.lock();
        let idx = state.operations.iter().position(|op| op.id == id)?;
        let op = state.operations.remove(idx);
        state.retry_delays.remove(id);
        state.queue_dirty = true;
        self.flush(&mut state);
        Some(op)
    }

    /// Snapshot of one operation in the main queue
    pub fn get_operation(&self, id: &str) -> Option<QueuedOperation> {
        self.lock().operations.iter().find(|op| op.id == id).cloned()
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// Pending operations, high priority first, insertion order within a tier
    pub fn get_pending_operations(&self) -> Vec<QueuedOperation> {
        self.lock()
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect()
    }

    /// Whether the backoff delay for this operation has elapsed
    pub fn is_operation_ready_for_retry(&self, op: &QueuedOperation) -> bool {
        let state = self.lock();
        self.ready_at(&state, op, now_millis())
    }

    fn ready_at(&self, state: &QueueState, op: &QueuedOperation, now: i64) -> bool {
        if op.retry_count == 0 {
            return true;
        }
        let Some(last_retry) = op.last_retry_timestamp else {
            return true;
        };
        let delay = state
            .retry_delays
            .get(&op.id)
            .copied()
            .unwrap_or_else(|| self.retry.base_delay_ms(op.retry_count));
        now.saturating_sub(last_retry) >= delay as i64
    }

    /// Pending operations whose backoff has elapsed, in drain order
    pub fn get_ready_operations(&self) -> Vec<QueuedOperation> {
        let state = self.lock();
        let now = now_millis();
        state
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending && self.ready_at(&state, op, now))
            .cloned()
            .collect()
    }

    // ========================================================================
    // State Transitions
    // ========================================================================

    /// Set an operation's status, returning the status it ends up in
    ///
    /// A failure with no retries left becomes `DeadLetter` and the operation
    /// moves to the dead-letter archive.
    pub fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        error_message: Option<String>,
    ) -> Result<OperationStatus, QueueError> {
        let mut state = self.lock();
        let idx = state
            .operations
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let op = &mut state.operations[idx];
        op.status = status;
        if let Some(message) = error_message {
            op.error_message = Some(message);
        }
        if status == OperationStatus::Completed {
            op.timestamp = now_millis();
            op.error_message = None;
        }

        let final_status = if status == OperationStatus::Failed && op.retries_exhausted() {
            op.status = OperationStatus::DeadLetter;
            let op = state.operations.remove(idx);
            state.retry_delays.remove(id);
            log::warn!(
                "Operation {} ({}) exhausted {} retries, moved to dead-letter: {}",
                op.id,
                op.op_type,
                op.max_retries,
                op.error_message.as_deref().unwrap_or("unknown error")
            );
            state.dead_letter.push(op);
            let overflow = state.dead_letter.len().saturating_sub(self.config.dead_letter_limit);
            if overflow > 0 {
                state.dead_letter.drain(..overflow);
            }
            state.dead_letter_dirty = true;
            OperationStatus::DeadLetter
        } else {
            if status == OperationStatus::Completed {
                state.retry_delays.remove(id);
            }
            status
        };

        state.queue_dirty = true;
        self.flush(&mut state);
        Ok(final_status)
    }

    /// Consume one retry, put the operation back to pending and return the
    /// backoff delay before it becomes ready again
    pub fn increment_retry_count(&self, id: &str) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let op = state
            .operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if op.retries_exhausted() {
            return Err(QueueError::RetriesExhausted(id.to_string()));
        }

        op.retry_count += 1;
        op.last_retry_timestamp = Some(now_millis());
        op.status = OperationStatus::Pending;
        let delay = self.calculate_retry_delay(op.retry_count);

        log::info!(
            "Operation {} will retry in {}ms (attempt {}/{})",
            op.id,
            delay,
            op.retry_count,
            op.max_retries
        );

        state.retry_delays.insert(id.to_string(), delay);
        state.queue_dirty = true;
        self.flush(&mut state);
        Ok(delay)
    }

    /// Jittered backoff delay for the given retry count
    pub fn calculate_retry_delay(&self, retry_count: u32) -> u64 {
        self.retry.delay_ms(retry_count)
    }

    // ========================================================================
    // Stats & Maintenance
    // ========================================================================

    pub fn get_queue_stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for op in &state.operations {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Processing => stats.processing += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::DeadLetter => stats.dead_letter += 1,
            }
        }
        stats.dead_letter += state.dead_letter.len();
        stats.total = state.operations.len() + state.dead_letter.len();
        stats
    }

    /// Remove completed operations older than the configured age
    pub fn cleanup_completed_items(&self) -> usize {
        let mut state = self.lock();
        let removed = self.remove_old_completed(&mut state);
        if removed > 0 {
            log::info!("Cleaned up {} completed operations", removed);
            self.flush(&mut state);
        }
        removed
    }

    fn remove_old_completed(&self, state: &mut QueueState) -> usize {
        let max_age = i64::try_from(self.config.completed_max_age_ms).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(max_age);
        let before = state.operations.len();
        state
            .operations
            .retain(|op| !(op.status == OperationStatus::Completed && op.timestamp < cutoff));
        let removed = before - state.operations.len();
        if removed > 0 {
            prune_retry_delays(state);
            state.queue_dirty = true;
        }
        removed
    }

    pub fn get_dead_letter_queue(&self) -> Vec<QueuedOperation> {
        self.lock().dead_letter.clone()
    }

    /// Move a dead-lettered operation back into the main queue with a fresh
    /// retry budget; the id is preserved
    pub fn requeue_from_dead_letter(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let idx = state
            .dead_letter
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let mut op = state.dead_letter.remove(idx);
        op.retry_count = 0;
        op.status = OperationStatus::Pending;
        op.error_message = None;
        op.last_retry_timestamp = None;

        log::info!("Requeued dead-lettered operation {} ({})", op.id, op.op_type);

        insert_by_priority(&mut state.operations, op);
        state.queue_dirty = true;
        state.dead_letter_dirty = true;
        self.flush(&mut state);
        Ok(())
    }

    /// Remove every completed operation regardless of age
    pub fn clear_completed(&self) -> usize {
        let mut state = self.lock();
        let before = state.operations.len();
        state
            .operations
            .retain(|op| op.status != OperationStatus::Completed);
        let removed = before - state.operations.len();
        if removed > 0 {
            prune_retry_delays(&mut state);
            state.queue_dirty = true;
            self.flush(&mut state);
        }
        removed
    }

    /// Drop the whole main queue
    pub fn clear_queue(&self) -> usize {
        let mut state = self.lock();
        let removed = state.operations.len();
        state.operations.clear();
        state.retry_delays.clear();
        state.queue_dirty = true;
        self.flush(&mut state);
        log::info!("Cleared {} operations from queue", removed);
        removed
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write both lists to the store, reporting failures to the caller
    pub fn persist(&self) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.queue_dirty = true;
        state.dead_letter_dirty = true;
        self.flush(&mut state);
        if state.queue_dirty || state.dead_letter_dirty {
            Err(QueueError::Store(
                "queue state could not be written".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Write any dirty list; failures are logged and retried on next flush
    fn flush(&self, state: &mut QueueState) {
        if state.queue_dirty {
            match write_list(self.store.as_ref(), QUEUE_KEY, &state.operations) {
                Ok(()) => state.queue_dirty = false,
                Err(e) => log::error!("Failed to persist operation queue: {}", e),
            }
        }
        if state.dead_letter_dirty {
            match write_list(self.store.as_ref(), DEAD_LETTER_KEY, &state.dead_letter) {
                Ok(()) => state.dead_letter_dirty = false,
                Err(e) => log::error!("Failed to persist dead-letter queue: {}", e),
            }
        }
    }

    /// Spawn the periodic cleanup loop
    pub fn start_cleanup_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        queue.cleanup_completed_items();
                    }
                }
            }

            log::debug!("Queue cleanup loop exited");
        })
    }
}

/// Forget backoff delays of operations no longer in the main queue
fn prune_retry_delays(state: &mut QueueState) {
    let QueueState {
        operations,
        retry_delays,
        ..
    } = state;
    retry_delays.retain(|id, _| operations.iter().any(|op| &op.id == id));
}

/// Insert after every operation of equal or higher priority
fn insert_by_priority(operations: &mut Vec<QueuedOperation>, op: QueuedOperation) {
    let pos = operations
        .iter()
        .position(|existing| existing.priority > op.priority)
        .unwrap_or(operations.len());
    operations.insert(pos, op);
}

fn read_list(store: &dyn QueueStore, key: &str) -> Vec<QueuedOperation> {
    match store.get(key) {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
            log::error!("Discarding unreadable {} blob: {}", key, e);
            Vec::new()
        }),
        Ok(None) => Vec::new(),
        Err(e) => {
            log::error!("Failed to read {} from store: {}", key, e);
            Vec::new()
        }
    }
}

fn write_list(
    store: &dyn QueueStore,
    key: &str,
    operations: &[QueuedOperation],
) -> Result<(), QueueError> {
    let json =
        serde_json::to_string(operations).map_err(|e| QueueError::Serialization(e.to_string()))?;
    store
        .set(key, &json)
        .map_err(|e| QueueError::Store(e.to_string()))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (max {max_size} operations)")]
    QueueFull { max_size: usize },

    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Operation {0} has no retries left")]
    RetriesExhausted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::store::MemoryStore;
    use serde_json::json;

    fn create_test_queue() -> (Arc<MemoryStore>, OperationQueue) {
        create_queue_with(QueueConfig::default(), RetryPolicy::default())
    }

    fn create_queue_with(
        config: QueueConfig,
        retry: RetryPolicy,
    ) -> (Arc<MemoryStore>, OperationQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = OperationQueue::load(store.clone(), config, retry);
        (store, queue)
    }

    fn enqueue(queue: &OperationQueue, priority: Priority) -> String {
        queue
            .enqueue(OperationType::AutomationExecute, json!({}), priority, 3)
            .unwrap()
    }

    #[test]
    fn test_enqueue_assigns_pending_state() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Normal);

        let op = queue.get_operation(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.max_retries, 3);
        assert!(op.last_retry_timestamp.is_none());
        assert_eq!(queue.get_queue_stats().pending, 1);
    }

    #[test]
    fn test_priority_ordering_regardless_of_enqueue_order() {
        let (_, queue) = create_test_queue();
        let low = enqueue(&queue, Priority::Low);
        let normal = enqueue(&queue, Priority::Normal);
        let high1 = enqueue(&queue, Priority::High);
        let low2 = enqueue(&queue, Priority::Low);
        let high2 = enqueue(&queue, Priority::High);

        let ids: Vec<String> = queue
            .get_pending_operations()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![high1, high2, normal, low, low2]);
    }

    #[test]
    fn test_queue_full_rejects() {
        let config = QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        };
        let (_, queue) = create_queue_with(config, RetryPolicy::default());
        enqueue(&queue, Priority::Normal);
        enqueue(&queue, Priority::Normal);

        let result = queue.enqueue(OperationType::ShareCreate, json!({}), Priority::High, 3);
        assert!(matches!(result, Err(QueueError::QueueFull { max_size: 2 })));
        assert_eq!(queue.get_pending_operations().len(), 2);
    }

    #[test]
    fn test_queue_full_evicts_old_completed_first() {
        let config = QueueConfig {
            max_queue_size: 2,
            completed_max_age_ms: 0,
            ..QueueConfig::default()
        };
        let (_, queue) = create_queue_with(config, RetryPolicy::default());
        let done = enqueue(&queue, Priority::Normal);
        enqueue(&queue, Priority::Normal);
        queue
            .update_operation_status(&done, OperationStatus::Completed, None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let third = queue.enqueue(OperationType::ShareCreate, json!({}), Priority::High, 3);
        assert!(third.is_ok());
        assert!(queue.get_operation(&done).is_none());
    }

    #[test]
    fn test_dequeue() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Normal);

        let op = queue.dequeue(&id).unwrap();
        assert_eq!(op.id, id);
        assert!(queue.dequeue(&id).is_none());
        assert_eq!(queue.get_queue_stats().total, 0);
    }

    #[test]
    fn test_increment_retry_count_schedules_backoff() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Normal);
        queue
            .update_operation_status(&id, OperationStatus::Failed, Some("timeout".into()))
            .unwrap();

        let delay = queue.increment_retry_count(&id).unwrap();
        assert!((1000..=1100).contains(&delay));

        let op = queue.get_operation(&id).unwrap();
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.error_message.as_deref(), Some("timeout"));
        assert!(op.last_retry_timestamp.is_some());

        // Pending but still backing off
        assert_eq!(queue.get_pending_operations().len(), 1);
        assert!(!queue.is_operation_ready_for_retry(&op));
        assert!(queue.get_ready_operations().is_empty());
    }

    #[test]
    fn test_ready_after_backoff_elapses() {
        let retry = RetryPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 20,
            ..RetryPolicy::default()
        };
        let (_, queue) = create_queue_with(QueueConfig::default(), retry);
        let id = enqueue(&queue, Priority::Normal);
        queue.increment_retry_count(&id).unwrap();
        assert!(queue.get_ready_operations().is_empty());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(queue.get_ready_operations().len(), 1);
    }

    #[test]
    fn test_first_attempt_always_ready() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Low);
        let op = queue.get_operation(&id).unwrap();
        assert!(queue.is_operation_ready_for_retry(&op));

        let mut never_retried = op.clone();
        never_retried.retry_count = 2;
        never_retried.last_retry_timestamp = None;
        assert!(queue.is_operation_ready_for_retry(&never_retried));
    }

    #[test]
    fn test_dead_letter_after_retries_exhausted() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Normal);

        for _ in 0..3 {
            let status = queue
                .update_operation_status(&id, OperationStatus::Failed, Some("boom".into()))
                .unwrap();
            assert_eq!(status, OperationStatus::Failed);
            queue.increment_retry_count(&id).unwrap();
        }
        assert!(matches!(
            queue.increment_retry_count(&id),
            Err(QueueError::RetriesExhausted(_))
        ));

        let status = queue
            .update_operation_status(&id, OperationStatus::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!(status, OperationStatus::DeadLetter);

        assert!(queue.get_pending_operations().is_empty());
        assert!(queue.get_operation(&id).is_none());
        let dead = queue.get_dead_letter_queue();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, OperationStatus::DeadLetter);
        assert_eq!(dead[0].retry_count, 3);
        assert_eq!(queue.get_queue_stats().dead_letter, 1);
    }

    #[test]
    fn test_requeue_from_dead_letter_resets_budget() {
        let (_, queue) = create_test_queue();
        let id = queue
            .enqueue(OperationType::NfcWrite, json!({}), Priority::High, 0)
            .unwrap();
        queue
            .update_operation_status(&id, OperationStatus::Failed, Some("tag lost".into()))
            .unwrap();
        assert_eq!(queue.get_dead_letter_queue().len(), 1);

        queue.requeue_from_dead_letter(&id).unwrap();

        let op = queue.get_operation(&id).unwrap();
        assert_eq!(op.id, id);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.error_message.is_none());
        assert!(queue.get_dead_letter_queue().is_empty());

        assert!(matches!(
            queue.requeue_from_dead_letter(&id),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_dead_letter_is_bounded() {
        let config = QueueConfig {
            dead_letter_limit: 3,
            ..QueueConfig::default()
        };
        let (_, queue) = create_queue_with(config, RetryPolicy::default());

        let ids: Vec<String> = (0..5)
            .map(|_| {
                let id = queue
                    .enqueue(OperationType::QrGenerate, json!({}), Priority::Low, 0)
                    .unwrap();
                queue
                    .update_operation_status(&id, OperationStatus::Failed, None)
                    .unwrap();
                id
            })
            .collect();

        let dead: Vec<String> = queue
            .get_dead_letter_queue()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(dead, ids[2..].to_vec());
    }

    #[test]
    fn test_cleanup_completed_items_respects_age() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Normal);
        queue
            .update_operation_status(&id, OperationStatus::Completed, None)
            .unwrap();

        // Younger than an hour: kept
        assert_eq!(queue.cleanup_completed_items(), 0);
        assert_eq!(queue.get_queue_stats().completed, 1);

        // Explicit clear ignores age
        assert_eq!(queue.clear_completed(), 1);
        assert_eq!(queue.get_queue_stats().total, 0);
    }

    #[test]
    fn test_completed_retries_leave_no_backoff_behind() {
        let config = QueueConfig {
            completed_max_age_ms: 0,
            ..QueueConfig::default()
        };
        let (_, queue) = create_queue_with(config, RetryPolicy::default());

        for _ in 0..50 {
            let id = enqueue(&queue, Priority::Normal);
            queue
                .update_operation_status(&id, OperationStatus::Failed, Some("timeout".into()))
                .unwrap();
            queue.increment_retry_count(&id).unwrap();
            queue
                .update_operation_status(&id, OperationStatus::Completed, None)
                .unwrap();
        }
        assert!(queue.lock().retry_delays.is_empty());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(queue.cleanup_completed_items(), 50);
        assert!(queue.lock().retry_delays.is_empty());
    }

    #[test]
    fn test_clear_completed_drops_stale_backoff() {
        let (_, queue) = create_test_queue();
        let id = enqueue(&queue, Priority::Normal);
        let kept = enqueue(&queue, Priority::Normal);
        for op in [&id, &kept] {
            queue
                .update_operation_status(op, OperationStatus::Failed, None)
                .unwrap();
            queue.increment_retry_count(op).unwrap();
        }
        // Completed without going through update_operation_status
        queue.lock().operations[0].status = OperationStatus::Completed;

        assert_eq!(queue.clear_completed(), 1);
        let state = queue.lock();
        assert_eq!(state.retry_delays.len(), 1);
        assert!(state.retry_delays.contains_key(&state.operations[0].id));
    }

    #[test]
    fn test_unbounded_completed_age_keeps_everything() {
        let config = QueueConfig {
            completed_max_age_ms: u64::MAX,
            ..QueueConfig::default()
        };
        let (_, queue) = create_queue_with(config, RetryPolicy::default());
        let id = enqueue(&queue, Priority::Normal);
        queue
            .update_operation_status(&id, OperationStatus::Completed, None)
            .unwrap();

        assert_eq!(queue.cleanup_completed_items(), 0);
        assert_eq!(queue.get_queue_stats().completed, 1);
    }

    #[test]
    fn test_clear_queue() {
        let (_, queue) = create_test_queue();
        enqueue(&queue, Priority::High);
        enqueue(&queue, Priority::Low);
        assert_eq!(queue.clear_queue(), 2);
        assert!(queue.get_pending_operations().is_empty());
    }

    #[test]
    fn test_queue_survives_reload() {
        let (store, queue) = create_test_queue();
        let low = enqueue(&queue, Priority::Low);
        let high = enqueue(&queue, Priority::High);
        let dead = queue
            .enqueue(OperationType::ShareCreate, json!({ "x": 1 }), Priority::Normal, 0)
            .unwrap();
        queue
            .update_operation_status(&dead, OperationStatus::Failed, None)
            .unwrap();
        queue
            .update_operation_status(&low, OperationStatus::Processing, None)
            .unwrap();
        drop(queue);

        let reloaded = OperationQueue::load(store, QueueConfig::default(), RetryPolicy::default());
        let ids: Vec<String> = reloaded
            .get_pending_operations()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![high, low]);
        assert_eq!(reloaded.get_dead_letter_queue()[0].id, dead);
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        let (store, queue) = create_test_queue();
        store.set_fail_writes(true);

        let id = enqueue(&queue, Priority::Normal);
        assert!(queue.get_operation(&id).is_some());
        assert!(store.get(QUEUE_KEY).unwrap().is_none());
        assert!(queue.persist().is_err());

        store.set_fail_writes(false);
        queue.persist().unwrap();
        let blob = store.get(QUEUE_KEY).unwrap().unwrap();
        assert!(blob.contains(&id));
    }

    #[test]
    fn test_unreadable_blob_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(QUEUE_KEY, "not json").unwrap();

        let queue = OperationQueue::load(store, QueueConfig::default(), RetryPolicy::default());
        assert_eq!(queue.get_queue_stats().total, 0);
    }

    #[tokio::test]
    async fn test_cleanup_timer_runs() {
        let config = QueueConfig {
            cleanup_interval_ms: 10,
            completed_max_age_ms: 0,
            ..QueueConfig::default()
        };
        let (_, queue) = create_queue_with(config, RetryPolicy::default());
        let queue = Arc::new(queue);
        let id = enqueue(&queue, Priority::Normal);
        queue
            .update_operation_status(&id, OperationStatus::Completed, None)
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = queue.start_cleanup_timer(cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(queue.get_queue_stats().total, 0);
    }
}
