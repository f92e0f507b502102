//! Progress tracking for batch validation.

use crate::core::types::ValidationResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Snapshot of batch progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Records finished so far.
    pub processed: usize,
    /// Records in the batch.
    pub total: usize,
    /// Finished records that are valid.
    pub valid: usize,
    /// Finished records that are invalid.
    pub invalid: usize,
    /// Total error issues across finished records.
    pub errors: usize,
    /// Completion in percent.
    pub percent: f32,
    /// Time since the batch started.
    pub elapsed_ms: u64,
    /// Records finished per second so far.
    pub throughput_per_sec: f64,
    /// Estimated time to finish, once at least one record is done.
    pub estimated_remaining_ms: Option<u64>,
}

/// Tracks batch progress and allows cancellation.
///
/// Counters are atomics so worker threads can report without locking; only
/// the per-record times used for estimation sit behind a mutex.
pub struct ProgressTracker {
    total: usize,
    processed: AtomicU64,
    valid: AtomicU64,
    errors: AtomicU64,
    cancelled: AtomicBool,
    start_time: Instant,
    record_times: Mutex<Vec<u64>>,
}

impl ProgressTracker {
    /// Create a tracker for a batch; the clock starts now.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            processed: AtomicU64::new(0),
            valid: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            start_time: Instant::now(),
            record_times: Mutex::new(Vec::new()),
        }
    }

    /// Report a finished record and return the updated snapshot.
    pub fn record_completed(&self, result: &ValidationResult, duration_ms: u64) -> ProgressUpdate {
        self.record_times.lock().push(duration_ms);
        if result.is_valid {
            self.valid.fetch_add(1, Ordering::Relaxed);
        }
        self.errors
            .fetch_add(result.counts().errors as u64, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.snapshot()
    }

    /// Check if the batch should stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation. Takes effect at the next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Records in the batch.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Records finished so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed) as usize
    }

    /// Get current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        (self.processed() as f32 / self.total as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.record_times.lock();
        if times.is_empty() {
            return None;
        }

        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let remaining = self.total.saturating_sub(self.processed());

        Some(avg_time * remaining as u64)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressUpdate {
        let processed = self.processed();
        let valid = self.valid.load(Ordering::Relaxed) as usize;
        let elapsed = self.start_time.elapsed();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        ProgressUpdate {
            processed,
            total: self.total,
            valid,
            invalid: processed.saturating_sub(valid),
            errors: self.errors.load(Ordering::Relaxed) as usize,
            percent: self.progress_percent(),
            elapsed_ms: elapsed.as_millis() as u64,
            throughput_per_sec: throughput,
            estimated_remaining_ms: self.estimated_remaining_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::Record;
    use crate::core::types::{Aspect, ValidationIssue, ValidationRequest};
    use serde_json::json;

    fn result(valid: bool) -> ValidationResult {
        let request = ValidationRequest::new(Record::new(json!({"resourceType": "Patient"})).unwrap());
        if valid {
            ValidationResult::aggregate(&request, Default::default(), Default::default())
        } else {
            ValidationResult::synthesized_failure(
                &request,
                ValidationIssue::error(Aspect::Structural, "x", "broken"),
            )
        }
    }

    #[test]
    fn test_progress_calculation() {
        let tracker = ProgressTracker::new(4);
        assert_eq!(tracker.progress_percent(), 0.0);
        assert_eq!(tracker.estimated_remaining_ms(), None);

        tracker.record_completed(&result(true), 10);
        let update = tracker.record_completed(&result(false), 30);
        assert_eq!(update.processed, 2);
        assert_eq!(update.valid, 1);
        assert_eq!(update.invalid, 1);
        assert_eq!(update.errors, 1);
        assert_eq!(update.percent, 50.0);
        assert_eq!(update.estimated_remaining_ms, Some(40));
    }

    #[test]
    fn test_cancellation() {
        let tracker = ProgressTracker::new(10);
        assert!(!tracker.is_cancelled());

        tracker.cancel();
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_empty_batch_is_complete() {
        assert_eq!(ProgressTracker::new(0).progress_percent(), 100.0);
    }
}
