//! Ledger entries and events of the cancellation/retry service.

use crate::execution::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Kind of operation a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// A bulk validation job, stopped through the shared stop flag.
    Bulk,
    /// One queued validation.
    QueueItem,
    /// A batch of queued validations.
    QueueBatch,
    /// Progress tracking of one record.
    Individual,
    /// A running pipeline.
    Pipeline,
    /// Every kind above.
    All,
}

impl OperationType {
    /// The concrete kinds that `All` expands to.
    pub const CONCRETE: [OperationType; 5] = [
        OperationType::Bulk,
        OperationType::QueueItem,
        OperationType::QueueBatch,
        OperationType::Individual,
        OperationType::Pipeline,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Bulk => "bulk",
            OperationType::QueueItem => "queue-item",
            OperationType::QueueBatch => "queue-batch",
            OperationType::Individual => "individual",
            OperationType::Pipeline => "pipeline",
            OperationType::All => "all",
        }
    }

    /// Retry policy used when a command brings no override.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        let (attempts, delay_secs) = match self {
            OperationType::Bulk => (3, 10),
            OperationType::QueueItem => (3, 5),
            OperationType::QueueBatch => (2, 15),
            OperationType::Individual => (5, 2),
            OperationType::Pipeline => (3, 5),
            OperationType::All => return RetryPolicy::default(),
        };
        RetryPolicy::new(attempts, Duration::from_secs(delay_secs))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationStatus {
    /// Recorded, not yet delegated.
    Pending,
    /// Handed to the collaborator.
    InProgress,
    /// The collaborator confirmed the cancellation.
    Completed,
    /// The collaborator refused or failed.
    Failed,
}

impl CancellationStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CancellationStatus::Completed | CancellationStatus::Failed)
    }
}

/// State of a retry request.
///
/// Transitions only move forward:
/// `Pending -> Scheduled -> InProgress -> {Completed | Exhausted}`, with
/// `InProgress -> Scheduled` between attempts and `Failed` for requests
/// cancelled or failing permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Recorded, no attempt scheduled yet.
    Pending,
    /// Waiting for the next attempt's timer.
    Scheduled,
    /// An attempt is running.
    InProgress,
    /// An attempt succeeded.
    Completed,
    /// Cancelled, or failed with a permanent error.
    Failed,
    /// Every attempt failed.
    Exhausted,
}

impl RetryStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryStatus::Completed | RetryStatus::Failed | RetryStatus::Exhausted
        )
    }
}

macro_rules! status_display {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = serde_json::to_value(self)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                f.write_str(&text)
            }
        }
    )*};
}

status_display!(CancellationStatus, RetryStatus);

/// A cancellation command and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationRequest {
    /// Request id.
    pub id: Uuid,
    /// Kind of operation.
    pub operation: OperationType,
    /// Id of the operation being cancelled.
    pub target_id: String,
    /// Why it was cancelled.
    pub reason: String,
    /// Who asked.
    pub requested_by: String,
    /// Current state.
    pub status: CancellationStatus,
    /// Units cancelled (items of a batch, for instance).
    pub affected: usize,
    /// Failure reason, when failed.
    pub error: Option<String>,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl CancellationRequest {
    pub(crate) fn new(operation: OperationType, target_id: &str, reason: &str, requested_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            operation,
            target_id: target_id.to_string(),
            reason: reason.to_string(),
            requested_by: requested_by.to_string(),
            status: CancellationStatus::Pending,
            affected: 0,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub(crate) fn transition(&mut self, status: CancellationStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }
}

/// A retry command and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRequest {
    /// Request id.
    pub id: Uuid,
    /// Kind of operation.
    pub operation: OperationType,
    /// Id of the operation being retried.
    pub target_id: String,
    /// Why it is retried.
    pub reason: String,
    /// Who asked.
    pub requested_by: String,
    /// Attempts the operation had made before this request.
    pub original_attempts: u32,
    /// Attempts this request may make.
    pub max_attempts: u32,
    /// Delay before the next attempt, in milliseconds.
    pub current_delay_ms: u64,
    /// Current state.
    pub status: RetryStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// When the next attempt runs.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Effective policy.
    pub policy: RetryPolicy,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl RetryRequest {
    pub(crate) fn new(
        operation: OperationType,
        target_id: &str,
        reason: &str,
        requested_by: &str,
        original_attempts: u32,
        policy: RetryPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            operation,
            target_id: target_id.to_string(),
            reason: reason.to_string(),
            requested_by: requested_by.to_string(),
            original_attempts,
            max_attempts: policy.max_attempts.max(1),
            current_delay_ms: policy.base_delay().as_millis() as u64,
            status: RetryStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            policy,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub(crate) fn transition(&mut self, status: RetryStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
            self.next_attempt_at = None;
        }
    }
}

/// Lifecycle events of the cancellation/retry service.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A cancellation was recorded.
    CancellationRequested {
        /// Ledger id of the cancellation.
        request_id: Uuid,
        /// Kind of operation targeted.
        operation: OperationType,
        /// Id of the targeted operation.
        target_id: String,
    },
    /// The collaborator confirmed a cancellation.
    CancellationCompleted {
        /// Ledger id of the cancellation.
        request_id: Uuid,
        /// Kind of operation targeted.
        operation: OperationType,
        /// Id of the targeted operation.
        target_id: String,
        /// Operations actually cancelled.
        affected: usize,
    },
    /// A cancellation could not be carried out.
    CancellationFailed {
        /// Ledger id of the cancellation.
        request_id: Uuid,
        /// Kind of operation targeted.
        operation: OperationType,
        /// Id of the targeted operation.
        target_id: String,
        /// Why it failed.
        error: String,
    },
    /// An attempt was scheduled.
    RetryScheduled {
        /// Ledger id of the retry.
        request_id: Uuid,
        /// 1-based number of the scheduled attempt.
        attempt: u32,
        /// Delay before it runs.
        delay_ms: u64,
    },
    /// An attempt started.
    RetryStarted {
        /// Ledger id of the retry.
        request_id: Uuid,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// An attempt succeeded.
    RetryCompleted {
        /// Ledger id of the retry.
        request_id: Uuid,
        /// Attempts used.
        attempts: u32,
    },
    /// An attempt failed.
    RetryFailed {
        /// Ledger id of the retry.
        request_id: Uuid,
        /// 1-based attempt number.
        attempt: u32,
        /// Error of the attempt.
        error: String,
    },
    /// The last allowed attempt failed.
    RetryExhausted {
        /// Ledger id of the retry.
        request_id: Uuid,
        /// Attempts used.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },
    /// A pending retry was cancelled.
    RetryCancelled {
        /// Ledger id of the retry.
        request_id: Uuid,
    },
    /// Every operation was cancelled and the stop flag raised.
    EmergencyStop {
        /// Why the stop was requested.
        reason: String,
        /// Who requested it.
        requested_by: String,
        /// Operations cancelled.
        cancelled: usize,
    },
    /// Expired ledger entries were removed.
    LedgerCleaned {
        /// Entries removed.
        removed: usize,
    },
}

/// Ledger counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStats {
    /// Cancellations not yet terminal.
    pub active_cancellations: usize,
    /// Cancellations that completed.
    pub completed_cancellations: usize,
    /// Cancellations that failed.
    pub failed_cancellations: usize,
    /// Retries not yet terminal.
    pub active_retries: usize,
    /// Retries that succeeded.
    pub completed_retries: usize,
    /// Retries that ran out of attempts.
    pub exhausted_retries: usize,
    /// Retries that failed or were cancelled.
    pub failed_retries: usize,
    /// Whether the shared stop flag is raised.
    pub stop_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_type_policies() {
        let bulk = OperationType::Bulk.default_retry_policy();
        assert_eq!((bulk.max_attempts, bulk.base_delay_ms), (3, 10_000));
        let batch = OperationType::QueueBatch.default_retry_policy();
        assert_eq!((batch.max_attempts, batch.base_delay_ms), (2, 15_000));
        let single = OperationType::Individual.default_retry_policy();
        assert_eq!((single.max_attempts, single.base_delay_ms), (5, 2_000));
        assert_eq!(OperationType::All.default_retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(CancellationStatus::InProgress.to_string(), "in_progress");
        assert_eq!(RetryStatus::Exhausted.to_string(), "exhausted");
        assert_eq!(serde_json::to_string(&OperationType::QueueItem).unwrap(), "\"queue-item\"");
    }

    #[test]
    fn test_terminal_transition_stamps_completion() {
        let mut request = RetryRequest::new(
            OperationType::Pipeline,
            "p1",
            "flaky",
            "ops",
            1,
            RetryPolicy::default(),
        );
        assert_eq!(request.current_delay_ms, 5_000);
        request.transition(RetryStatus::Scheduled);
        assert!(request.completed_at.is_none());
        request.transition(RetryStatus::Exhausted);
        assert!(request.completed_at.is_some());
    }
}
