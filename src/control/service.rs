//! Operator lifecycle control: cancellation, retry scheduling and
//! emergency stop.
//!
//! Commands never fail towards the caller on operational problems. The
//! outcome is recorded on the ledger entry and published as a
//! [`ControlEvent`]; callers poll the ledger or subscribe.

use crate::control::stop::StopSignal;
use crate::control::types::{
    CancellationRequest, CancellationStatus, ControlEvent, ControlStats, OperationType, RetryRequest, RetryStatus,
};
use crate::core::error::{ControlError, ControlResult};
use crate::core::events::EventBus;
use crate::core::services::{PipelineControl, ProgressService, QueueService};
use crate::execution::retry::RetryPolicyOverride;
use chrono::Utc;
use crossbeam::channel::{after, bounded, tick, Receiver, Sender};
use crossbeam::select;
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

/// Target id used for bulk cancellations, which have no single target.
pub const BULK_TARGET: &str = "*";

/// How long terminal ledger entries are kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the cleanup task runs.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Performs one retry attempt of an operation.
pub trait RetryHandler: Send + Sync {
    /// Retry `target_id`. `attempt` is 1-based. An `Err` carries the failure
    /// message, which is matched against the policy's classifiers.
    fn retry(&self, operation: OperationType, target_id: &str, attempt: u32) -> Result<(), String>;
}

impl<F> RetryHandler for F
where
    F: Fn(OperationType, &str, u32) -> Result<(), String> + Send + Sync,
{
    fn retry(&self, operation: OperationType, target_id: &str, attempt: u32) -> Result<(), String> {
        self(operation, target_id, attempt)
    }
}

struct Inner {
    queue: Option<Arc<dyn QueueService>>,
    progress: Option<Arc<dyn ProgressService>>,
    pipelines: Option<Arc<dyn PipelineControl>>,
    handlers: HashMap<OperationType, Arc<dyn RetryHandler>>,
    cancellations: RwLock<IndexMap<Uuid, CancellationRequest>>,
    retries: RwLock<IndexMap<Uuid, RetryRequest>>,
    /// Dropping a sender wakes and cancels its timer.
    timers: Mutex<HashMap<Uuid, Sender<()>>>,
    stop: StopSignal,
    events: EventBus<ControlEvent>,
    retention: Duration,
}

/// Builder for [`CancellationRetryService`].
pub struct CancellationRetryServiceBuilder {
    queue: Option<Arc<dyn QueueService>>,
    progress: Option<Arc<dyn ProgressService>>,
    pipelines: Option<Arc<dyn PipelineControl>>,
    handlers: HashMap<OperationType, Arc<dyn RetryHandler>>,
    stop: StopSignal,
    retention: Duration,
}

impl CancellationRetryServiceBuilder {
    /// Cancel queue items and batches through `queue`.
    pub fn queue(mut self, queue: Arc<dyn QueueService>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Cancel per-record progress through `progress`.
    pub fn progress(mut self, progress: Arc<dyn ProgressService>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cancel pipelines through `pipelines`.
    pub fn pipelines(mut self, pipelines: Arc<dyn PipelineControl>) -> Self {
        self.pipelines = Some(pipelines);
        self
    }

    /// Share an existing stop signal, e.g. one a pipeline already watches.
    pub fn stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Keep terminal ledger entries for `retention`.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Register the retry action for an operation type.
    pub fn retry_handler<H>(mut self, operation: OperationType, handler: H) -> Self
    where
        H: RetryHandler + 'static,
    {
        self.handlers.insert(operation, Arc::new(handler));
        self
    }

    /// Build the service.
    pub fn build(self) -> CancellationRetryService {
        CancellationRetryService {
            inner: Arc::new(Inner {
                queue: self.queue,
                progress: self.progress,
                pipelines: self.pipelines,
                handlers: self.handlers,
                cancellations: RwLock::new(IndexMap::new()),
                retries: RwLock::new(IndexMap::new()),
                timers: Mutex::new(HashMap::new()),
                stop: self.stop,
                events: EventBus::new(),
                retention: self.retention,
            }),
        }
    }
}

/// Cancellation and retry control over validation operations.
///
/// Clones share the same ledgers, timers and stop signal.
#[derive(Clone)]
pub struct CancellationRetryService {
    inner: Arc<Inner>,
}

impl CancellationRetryService {
    /// Start building a service.
    pub fn builder() -> CancellationRetryServiceBuilder {
        CancellationRetryServiceBuilder {
            queue: None,
            progress: None,
            pipelines: None,
            handlers: HashMap::new(),
            stop: StopSignal::new(),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Subscribe to control events.
    pub fn subscribe(&self) -> Receiver<ControlEvent> {
        self.inner.events.subscribe()
    }

    /// The shared stop signal.
    pub fn stop_signal(&self) -> StopSignal {
        self.inner.stop.clone()
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.is_raised()
    }

    /// Lower the stop signal so bulk work can resume.
    pub fn reset_stop(&self) {
        self.inner.stop.reset();
        info!("Stop signal reset");
    }

    /// Cancel one operation.
    ///
    /// The request moves `Pending -> InProgress -> Completed | Failed` before
    /// this returns. Pending retries of the same target are cancelled too.
    pub fn cancel_operation(
        &self,
        operation: OperationType,
        target_id: &str,
        reason: &str,
        requested_by: &str,
    ) -> CancellationRequest {
        let mut request = CancellationRequest::new(operation, target_id, reason, requested_by);
        let id = request.id;
        self.inner.cancellations.write().insert(id, request.clone());
        self.inner.events.emit(ControlEvent::CancellationRequested {
            request_id: id,
            operation,
            target_id: target_id.to_string(),
        });

        self.update_cancellation(&mut request, |r| r.transition(CancellationStatus::InProgress));
        match self.delegate_cancel(operation, target_id, reason, requested_by) {
            Ok(affected) => {
                self.update_cancellation(&mut request, |r| {
                    r.affected = affected;
                    r.transition(CancellationStatus::Completed);
                });
                info!(
                    "Cancelled {} {} ({} affected): {}",
                    operation, target_id, affected, reason
                );
                self.cancel_retries_for(operation, target_id);
                self.inner.events.emit(ControlEvent::CancellationCompleted {
                    request_id: id,
                    operation,
                    target_id: target_id.to_string(),
                    affected,
                });
            }
            Err(error) => {
                self.update_cancellation(&mut request, |r| {
                    r.error = Some(error.clone());
                    r.transition(CancellationStatus::Failed);
                });
                warn!("Cancelling {} {} failed: {}", operation, target_id, error);
                self.inner.events.emit(ControlEvent::CancellationFailed {
                    request_id: id,
                    operation,
                    target_id: target_id.to_string(),
                    error,
                });
            }
        }
        request
    }

    /// Cancel every active operation of a type, or of every type for `All`.
    pub fn cancel_all_operations(
        &self,
        operation: OperationType,
        reason: &str,
        requested_by: &str,
    ) -> Vec<CancellationRequest> {
        let kinds: Vec<OperationType> = match operation {
            OperationType::All => OperationType::CONCRETE.to_vec(),
            other => vec![other],
        };

        let mut requests = Vec::new();
        for kind in kinds {
            for target in self.active_targets(kind) {
                requests.push(self.cancel_operation(kind, &target, reason, requested_by));
            }
        }
        requests
    }

    /// Raise the stop signal, cancel every active operation and every
    /// outstanding retry.
    pub fn emergency_stop(&self, reason: &str, requested_by: &str) -> Vec<CancellationRequest> {
        warn!("Emergency stop requested by {}: {}", requested_by, reason);
        self.inner.stop.raise_with(reason);

        let requests = self.cancel_all_operations(OperationType::All, reason, requested_by);
        let pending: Vec<Uuid> = self
            .inner
            .retries
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect();
        for id in pending {
            let _ = self.cancel_retry(id);
        }

        self.inner.events.emit(ControlEvent::EmergencyStop {
            reason: reason.to_string(),
            requested_by: requested_by.to_string(),
            cancelled: requests.len(),
        });
        requests
    }

    /// Schedule retries of an operation.
    ///
    /// `policy` is merged over the operation type's default. The first
    /// attempt runs after the policy's base delay.
    pub fn retry_operation(
        &self,
        operation: OperationType,
        target_id: &str,
        reason: &str,
        requested_by: &str,
        policy: Option<&RetryPolicyOverride>,
    ) -> RetryRequest {
        let default = operation.default_retry_policy();
        let policy = match policy {
            Some(overrides) => default.merged(overrides),
            None => default,
        };

        let request = RetryRequest::new(operation, target_id, reason, requested_by, 0, policy);
        let id = request.id;
        let delay = Duration::from_millis(request.current_delay_ms);
        self.inner.retries.write().insert(id, request.clone());
        info!("Retry of {} {} requested by {}: {}", operation, target_id, requested_by, reason);

        self.inner.schedule(id, delay);
        self.inner.retries.read().get(&id).cloned().unwrap_or(request)
    }

    /// Run the next attempt of a retry request now.
    ///
    /// Normally invoked by the request's timer. Does nothing unless the
    /// request is scheduled.
    pub fn execute_retry(&self, id: Uuid) {
        self.inner.execute_retry(id);
    }

    /// Cancel a retry request that has not completed.
    pub fn cancel_retry(&self, id: Uuid) -> ControlResult<RetryRequest> {
        let request = {
            let mut retries = self.inner.retries.write();
            let request = retries.get_mut(&id).ok_or(ControlError::UnknownRequest(id))?;
            if request.status.is_terminal() {
                return Err(ControlError::AlreadyTerminal {
                    id,
                    status: request.status.to_string(),
                });
            }
            request.last_error = Some("cancelled by user".to_string());
            request.transition(RetryStatus::Failed);
            request.clone()
        };

        self.inner.timers.lock().remove(&id);
        info!("Retry {} cancelled", id);
        self.inner.events.emit(ControlEvent::RetryCancelled { request_id: id });
        Ok(request)
    }

    /// Remove terminal ledger entries older than the retention period.
    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` on a
    /// background thread until the returned task is dropped.
    pub fn start_cleanup(&self, interval: Duration) -> std::io::Result<CleanupTask> {
        let (shutdown, stopped) = bounded::<()>(0);
        let inner = Arc::downgrade(&self.inner);
        let ticker = tick(interval);

        let handle = std::thread::Builder::new()
            .name("pariksha-ledger-cleanup".to_string())
            .spawn(move || loop {
                select! {
                    recv(stopped) -> _ => break,
                    recv(ticker) -> _ => match inner.upgrade() {
                        Some(inner) => {
                            inner.cleanup_expired();
                        }
                        None => break,
                    },
                }
            })?;

        Ok(CleanupTask {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Cancellations that have not reached a terminal state.
    pub fn active_cancellations(&self) -> Vec<CancellationRequest> {
        self.inner
            .cancellations
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Retries that have not reached a terminal state.
    pub fn active_retries(&self) -> Vec<RetryRequest> {
        self.inner
            .retries
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Look up a cancellation request.
    pub fn get_cancellation(&self, id: Uuid) -> ControlResult<CancellationRequest> {
        self.inner
            .cancellations
            .read()
            .get(&id)
            .cloned()
            .ok_or(ControlError::UnknownRequest(id))
    }

    /// Look up a retry request.
    pub fn get_retry(&self, id: Uuid) -> ControlResult<RetryRequest> {
        self.inner
            .retries
            .read()
            .get(&id)
            .cloned()
            .ok_or(ControlError::UnknownRequest(id))
    }

    /// Ledger counts.
    pub fn stats(&self) -> ControlStats {
        let mut stats = ControlStats {
            stop_requested: self.is_stop_requested(),
            ..ControlStats::default()
        };
        for request in self.inner.cancellations.read().values() {
            match request.status {
                CancellationStatus::Completed => stats.completed_cancellations += 1,
                CancellationStatus::Failed => stats.failed_cancellations += 1,
                _ => stats.active_cancellations += 1,
            }
        }
        for request in self.inner.retries.read().values() {
            match request.status {
                RetryStatus::Completed => stats.completed_retries += 1,
                RetryStatus::Exhausted => stats.exhausted_retries += 1,
                RetryStatus::Failed => stats.failed_retries += 1,
                _ => stats.active_retries += 1,
            }
        }
        stats
    }

    /// Cancel every pending timer. Ledger entries keep their status.
    pub fn shutdown(&self) {
        let cancelled = {
            let mut timers = self.inner.timers.lock();
            let count = timers.len();
            timers.clear();
            count
        };
        debug!("Shut down {} retry timers", cancelled);
    }

    fn update_cancellation<F>(&self, request: &mut CancellationRequest, update: F)
    where
        F: FnOnce(&mut CancellationRequest),
    {
        update(request);
        self.inner
            .cancellations
            .write()
            .insert(request.id, request.clone());
    }

    fn delegate_cancel(
        &self,
        operation: OperationType,
        target_id: &str,
        reason: &str,
        requested_by: &str,
    ) -> Result<usize, String> {
        let inner = &self.inner;
        match operation {
            OperationType::Bulk => {
                inner.stop.raise_with(reason);
                Ok(1)
            }
            OperationType::QueueItem => {
                let queue = inner.queue.as_ref().ok_or("queue service not configured")?;
                if queue.cancel_validation(target_id) {
                    Ok(1)
                } else {
                    Err(format!("queue item {} not found", target_id))
                }
            }
            OperationType::QueueBatch => {
                let queue = inner.queue.as_ref().ok_or("queue service not configured")?;
                match queue.cancel_batch(target_id) {
                    0 => Err(format!("batch {} has no cancellable items", target_id)),
                    count => Ok(count),
                }
            }
            OperationType::Individual => {
                let progress = inner
                    .progress
                    .as_ref()
                    .ok_or("progress service not configured")?;
                if progress.cancel_resource_progress(target_id) {
                    Ok(1)
                } else {
                    Err(format!("no progress tracked for {}", target_id))
                }
            }
            OperationType::Pipeline => {
                let pipelines = inner
                    .pipelines
                    .as_ref()
                    .ok_or("pipeline control not configured")?;
                if pipelines.cancel_pipeline(target_id) {
                    Ok(1)
                } else {
                    Err(format!("pipeline {} is not running", target_id))
                }
            }
            OperationType::All => {
                let requests = self.cancel_all_operations(OperationType::All, reason, requested_by);
                Ok(requests
                    .iter()
                    .filter(|r| r.status == CancellationStatus::Completed)
                    .map(|r| r.affected)
                    .sum())
            }
        }
    }

    fn active_targets(&self, operation: OperationType) -> Vec<String> {
        let inner = &self.inner;
        match operation {
            OperationType::Bulk => vec![BULK_TARGET.to_string()],
            OperationType::QueueItem => inner.queue.as_ref().map(|q| q.active_items()).unwrap_or_default(),
            OperationType::QueueBatch => inner.queue.as_ref().map(|q| q.active_batches()).unwrap_or_default(),
            OperationType::Individual => inner
                .progress
                .as_ref()
                .map(|p| p.active_resources())
                .unwrap_or_default(),
            OperationType::Pipeline => inner
                .pipelines
                .as_ref()
                .map(|p| p.active_pipelines())
                .unwrap_or_default(),
            OperationType::All => Vec::new(),
        }
    }

    fn cancel_retries_for(&self, operation: OperationType, target_id: &str) {
        let matching: Vec<Uuid> = self
            .inner
            .retries
            .read()
            .values()
            .filter(|r| r.operation == operation && r.target_id == target_id && !r.status.is_terminal())
            .map(|r| r.id)
            .collect();
        for id in matching {
            let _ = self.cancel_retry(id);
        }
    }
}

impl Inner {
    /// Mark a request scheduled and arm its timer.
    fn schedule(self: &Arc<Self>, id: Uuid, delay: Duration) {
        let attempt = {
            let mut retries = self.retries.write();
            let Some(request) = retries.get_mut(&id) else {
                return;
            };
            if request.status.is_terminal() {
                return;
            }
            request.current_delay_ms = delay.as_millis() as u64;
            request.next_attempt_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            request.transition(RetryStatus::Scheduled);
            request.attempts + 1
        };

        let (cancel, cancelled) = bounded::<()>(0);
        self.timers.lock().insert(id, cancel);
        self.events.emit(ControlEvent::RetryScheduled {
            request_id: id,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        debug!("Retry {} attempt {} in {:?}", id, attempt, delay);

        let inner = self.clone();
        let spawned = std::thread::Builder::new()
            .name("pariksha-retry-timer".to_string())
            .spawn(move || {
                select! {
                    recv(cancelled) -> _ => {}
                    recv(after(delay)) -> _ => inner.execute_retry(id),
                }
            });
        if let Err(err) = spawned {
            warn!("Could not start retry timer for {}: {}", id, err);
            self.finish(id, RetryStatus::Failed, Some(format!("timer unavailable: {}", err)));
        }
    }

    fn execute_retry(self: &Arc<Self>, id: Uuid) {
        self.timers.lock().remove(&id);

        let (operation, target_id, attempt) = {
            let mut retries = self.retries.write();
            let Some(request) = retries.get_mut(&id) else {
                return;
            };
            if request.status != RetryStatus::Scheduled {
                return;
            }
            if request.attempts >= request.max_attempts {
                request.transition(RetryStatus::Exhausted);
                return;
            }
            request.attempts += 1;
            request.next_attempt_at = None;
            request.transition(RetryStatus::InProgress);
            (request.operation, request.target_id.clone(), request.attempts)
        };
        self.events.emit(ControlEvent::RetryStarted {
            request_id: id,
            attempt,
        });

        let outcome = match self.handlers.get(&operation) {
            Some(handler) => handler.retry(operation, &target_id, attempt),
            None => Err(format!("no retry handler configured for {}", operation)),
        };

        match outcome {
            Ok(()) => {
                if self.finish(id, RetryStatus::Completed, None) {
                    info!("Retry of {} {} succeeded on attempt {}", operation, target_id, attempt);
                    self.events.emit(ControlEvent::RetryCompleted {
                        request_id: id,
                        attempts: attempt,
                    });
                }
            }
            Err(error) => self.handle_failure(id, attempt, error),
        }
    }

    fn handle_failure(self: &Arc<Self>, id: Uuid, attempt: u32, error: String) {
        let next = {
            let mut retries = self.retries.write();
            let Some(request) = retries.get_mut(&id) else {
                return;
            };
            // Cancelled while the attempt ran
            if request.status != RetryStatus::InProgress {
                return;
            }
            request.last_error = Some(error.clone());

            if !request.policy.is_retryable(&error) {
                request.transition(RetryStatus::Failed);
                None
            } else if request.attempts >= request.max_attempts {
                request.transition(RetryStatus::Exhausted);
                None
            } else {
                let current = Duration::from_millis(request.current_delay_ms);
                Some(request.policy.next_delay(current))
            }
        };

        self.events.emit(ControlEvent::RetryFailed {
            request_id: id,
            attempt,
            error: error.clone(),
        });

        match next {
            Some(delay) => {
                debug!("Retry {} attempt {} failed ({}), rescheduling", id, attempt, error);
                self.schedule(id, delay);
            }
            None => {
                let status = self.retries.read().get(&id).map(|r| r.status);
                if status == Some(RetryStatus::Exhausted) {
                    warn!("Retry {} exhausted after {} attempts: {}", id, attempt, error);
                    self.events.emit(ControlEvent::RetryExhausted {
                        request_id: id,
                        attempts: attempt,
                        last_error: error,
                    });
                } else {
                    warn!("Retry {} failed permanently: {}", id, error);
                }
            }
        }
    }

    /// Move an in-flight request to a terminal state. Returns false when the
    /// request was already terminal.
    fn finish(&self, id: Uuid, status: RetryStatus, error: Option<String>) -> bool {
        let mut retries = self.retries.write();
        match retries.get_mut(&id) {
            Some(request) if !request.status.is_terminal() => {
                if error.is_some() {
                    request.last_error = error;
                }
                request.transition(status);
                true
            }
            _ => false,
        }
    }

    fn cleanup_expired(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let expired = |completed: Option<chrono::DateTime<Utc>>| completed.map_or(false, |at| at < cutoff);

        let removed = {
            let mut cancellations = self.cancellations.write();
            let before = cancellations.len();
            cancellations.retain(|_, r| !expired(r.completed_at));
            before - cancellations.len()
        } + {
            let mut retries = self.retries.write();
            let before = retries.len();
            retries.retain(|_, r| !expired(r.completed_at));
            before - retries.len()
        };

        if removed > 0 {
            info!("Removed {} expired ledger entries", removed);
        }
        self.events.emit(ControlEvent::LedgerCleaned { removed });
        removed
    }
}

/// Background ledger cleanup; stops when dropped.
pub struct CleanupTask {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Stop the task and wait for its thread.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // Disconnecting the channel wakes the thread
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    struct FakeQueue {
        items: Mutex<Vec<String>>,
    }

    impl FakeQueue {
        fn with(items: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    impl QueueService for FakeQueue {
        fn cancel_validation(&self, item_id: &str) -> bool {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|i| i != item_id);
            items.len() < before
        }

        fn cancel_batch(&self, _batch_id: &str) -> usize {
            let mut items = self.items.lock();
            let count = items.len();
            items.clear();
            count
        }

        fn active_items(&self) -> Vec<String> {
            self.items.lock().clone()
        }
    }

    fn fast(attempts: u32) -> RetryPolicyOverride {
        RetryPolicyOverride {
            max_attempts: Some(attempts),
            base_delay_ms: Some(20),
            ..RetryPolicyOverride::default()
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_cancel_queue_item() {
        let service = CancellationRetryService::builder()
            .queue(FakeQueue::with(&["q1"]))
            .build();
        let events = service.subscribe();

        let request = service.cancel_operation(OperationType::QueueItem, "q1", "user asked", "alice");
        assert_eq!(request.status, CancellationStatus::Completed);
        assert_eq!(request.affected, 1);
        assert!(request.completed_at.is_some());

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(
            &received[1],
            ControlEvent::CancellationCompleted { request_id, .. } if *request_id == request.id
        ));
    }

    #[test]
    fn test_cancel_failures_are_recorded() {
        let service = CancellationRetryService::builder()
            .queue(FakeQueue::with(&[]))
            .build();

        let unknown = service.cancel_operation(OperationType::QueueItem, "nope", "r", "ops");
        assert_eq!(unknown.status, CancellationStatus::Failed);
        assert!(unknown.error.unwrap().contains("not found"));

        let unconfigured = service.cancel_operation(OperationType::Pipeline, "p1", "r", "ops");
        assert_eq!(unconfigured.status, CancellationStatus::Failed);
        assert_eq!(service.stats().failed_cancellations, 2);
    }

    #[test]
    fn test_bulk_cancel_raises_stop() {
        let service = CancellationRetryService::builder().build();
        let request = service.cancel_operation(OperationType::Bulk, BULK_TARGET, "stop import", "ops");
        assert_eq!(request.status, CancellationStatus::Completed);
        assert!(service.is_stop_requested());
        service.reset_stop();
        assert!(!service.is_stop_requested());
    }

    #[test]
    fn test_cancel_all_queue_items() {
        let queue = FakeQueue::with(&["a", "b", "c"]);
        let service = CancellationRetryService::builder().queue(queue.clone()).build();
        let requests = service.cancel_all_operations(OperationType::QueueItem, "drain", "ops");
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.status == CancellationStatus::Completed));
        assert!(queue.active_items().is_empty());
    }

    #[test]
    fn test_emergency_stop() {
        let service = CancellationRetryService::builder()
            .queue(FakeQueue::with(&["a"]))
            .build();
        let events = service.subscribe();
        let retry = service.retry_operation(
            OperationType::QueueItem,
            "z",
            "flaky",
            "ops",
            Some(&RetryPolicyOverride {
                base_delay_ms: Some(60_000),
                ..RetryPolicyOverride::default()
            }),
        );

        service.emergency_stop("incident", "oncall");
        assert!(service.is_stop_requested());
        assert_eq!(service.get_retry(retry.id).unwrap().status, RetryStatus::Failed);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, ControlEvent::EmergencyStop { cancelled: 2, .. })));
    }

    #[test]
    fn test_retry_succeeds_on_second_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let service = CancellationRetryService::builder()
            .retry_handler(OperationType::Individual, move |_: OperationType, _: &str, attempt: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err("connection reset".to_string())
                } else {
                    Ok(())
                }
            })
            .build();

        let request = service.retry_operation(OperationType::Individual, "Patient/1", "flaky", "ops", Some(&fast(5)));
        assert_eq!(request.status, RetryStatus::Scheduled);
        assert_eq!(request.max_attempts, 5);

        assert!(wait_for(|| service.get_retry(request.id).unwrap().status == RetryStatus::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.get_retry(request.id).unwrap().attempts, 2);
    }

    #[test]
    fn test_non_retryable_failure() {
        let service = CancellationRetryService::builder()
            .retry_handler(OperationType::Pipeline, |_: OperationType, _: &str, _: u32| {
                Err("unauthorized".to_string())
            })
            .build();
        let request = service.retry_operation(OperationType::Pipeline, "p", "r", "ops", Some(&fast(3)));

        assert!(wait_for(|| service.get_retry(request.id).unwrap().status == RetryStatus::Failed));
        assert_eq!(service.get_retry(request.id).unwrap().attempts, 1);
    }

    #[test]
    fn test_missing_handler_exhausts() {
        let service = CancellationRetryService::builder().build();
        let request = service.retry_operation(OperationType::QueueBatch, "b", "r", "ops", Some(&fast(2)));
        assert!(wait_for(|| service.get_retry(request.id).unwrap().status == RetryStatus::Exhausted));
        let done = service.get_retry(request.id).unwrap();
        assert_eq!(done.attempts, 2);
        assert!(done.last_error.unwrap().contains("no retry handler"));
    }

    #[test]
    fn test_cancel_retry() {
        let service = CancellationRetryService::builder().build();
        let request = service.retry_operation(
            OperationType::Bulk,
            BULK_TARGET,
            "r",
            "ops",
            None,
        );
        let cancelled = service.cancel_retry(request.id).unwrap();
        assert_eq!(cancelled.status, RetryStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some("cancelled by user"));

        assert!(matches!(
            service.cancel_retry(request.id),
            Err(ControlError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            service.cancel_retry(Uuid::new_v4()),
            Err(ControlError::UnknownRequest(_))
        ));
        assert!(service.active_retries().is_empty());
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let service = CancellationRetryService::builder()
            .retention(Duration::from_millis(0))
            .build();
        service.cancel_operation(OperationType::Bulk, BULK_TARGET, "r", "ops");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(service.cleanup_expired(), 1);
        assert_eq!(service.stats(), ControlStats {
            stop_requested: true,
            ..ControlStats::default()
        });
    }

    #[test]
    fn test_cleanup_keeps_recent() {
        let service = CancellationRetryService::builder().build();
        service.cancel_operation(OperationType::Bulk, BULK_TARGET, "r", "ops");
        assert_eq!(service.cleanup_expired(), 0);
        assert_eq!(service.stats().completed_cancellations, 1);
    }

    #[test]
    fn test_cleanup_task_runs_and_stops() {
        let service = CancellationRetryService::builder()
            .retention(Duration::from_millis(0))
            .build();
        let events = service.subscribe();
        let task = service.start_cleanup(Duration::from_millis(10)).unwrap();
        assert!(events
            .recv_timeout(Duration::from_secs(5))
            .map(|e| matches!(e, ControlEvent::LedgerCleaned { .. }))
            .unwrap_or(false));
        task.stop();
    }
}
