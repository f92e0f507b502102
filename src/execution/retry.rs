//! Retry policies and the blocking retry helper.
//!
//! Errors are classified by message: non-retryable patterns win over
//! retryable ones, and messages matching neither are treated as transient.

use crate::core::error::SystemError;
use crate::core::types::RetryInfo;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message fragments that mark an error as transient.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "unavailable",
    "throttl",
    "rate limit",
    "too many requests",
    "admission limit",
    "circuit breaker open",
    "502",
    "503",
    "504",
];

/// Message fragments that mark an error as permanent.
pub const DEFAULT_NON_RETRYABLE_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "parse",
    "malformed",
    "unauthorized",
    "forbidden",
    "authorization",
    "not configured",
    "cancelled",
];

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt.
    Retryable,
    /// Retrying cannot help.
    NonRetryable,
}

/// How to retry a failing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Grow the delay after each failure.
    pub exponential: bool,
    /// Growth factor when exponential.
    pub backoff_multiplier: f64,
    /// Upper bound for any delay.
    pub max_delay_ms: u64,
    /// Fragments marking errors retryable.
    pub retryable_patterns: Vec<String>,
    /// Fragments marking errors permanent. Checked first.
    pub non_retryable_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            exponential: true,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            retryable_patterns: DEFAULT_RETRYABLE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            non_retryable_patterns: DEFAULT_NON_RETRYABLE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempts and base delay, other fields default.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    /// Use a constant delay.
    pub fn constant(mut self) -> Self {
        self.exponential = false;
        self
    }

    /// Delay before the first retry, capped.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms.min(self.max_delay_ms))
    }

    /// Delay following `current`: `current * multiplier`, capped.
    pub fn next_delay(&self, current: Duration) -> Duration {
        if !self.exponential {
            return current.min(Duration::from_millis(self.max_delay_ms));
        }
        let next_ms = (current.as_millis() as f64 * self.backoff_multiplier.max(1.0)).round();
        Duration::from_millis((next_ms as u64).min(self.max_delay_ms))
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let mut delay = self.base_delay();
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        delay
    }

    /// Classify an error message.
    pub fn classify(&self, message: &str) -> ErrorClass {
        let lower = message.to_lowercase();
        if self
            .non_retryable_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
        {
            return ErrorClass::NonRetryable;
        }
        if self
            .retryable_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
        {
            return ErrorClass::Retryable;
        }
        ErrorClass::Retryable
    }

    /// Whether an error message is worth retrying.
    pub fn is_retryable(&self, message: &str) -> bool {
        self.classify(message) == ErrorClass::Retryable
    }

    /// Apply an override on top of this policy.
    pub fn merged(&self, overrides: &RetryPolicyOverride) -> Self {
        let mut policy = self.clone();
        if let Some(v) = overrides.max_attempts {
            policy.max_attempts = v;
        }
        if let Some(v) = overrides.base_delay_ms {
            policy.base_delay_ms = v;
        }
        if let Some(v) = overrides.exponential {
            policy.exponential = v;
        }
        if let Some(v) = overrides.backoff_multiplier {
            policy.backoff_multiplier = v;
        }
        if let Some(v) = overrides.max_delay_ms {
            policy.max_delay_ms = v;
        }
        policy
    }
}

/// Partial policy merged over a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyOverride {
    /// Replaces [`RetryPolicy::max_attempts`].
    pub max_attempts: Option<u32>,
    /// Replaces [`RetryPolicy::base_delay_ms`].
    pub base_delay_ms: Option<u64>,
    /// Replaces [`RetryPolicy::exponential`].
    pub exponential: Option<bool>,
    /// Replaces [`RetryPolicy::backoff_multiplier`].
    pub backoff_multiplier: Option<f64>,
    /// Replaces [`RetryPolicy::max_delay_ms`].
    pub max_delay_ms: Option<u64>,
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// `op` receives the 1-based attempt number. Between attempts the calling
/// thread sleeps for the policy's backoff delay. A permanent error is
/// returned as-is; running out of attempts yields
/// [`SystemError::RetryExhausted`].
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, mut op: F) -> (Result<T, SystemError>, RetryInfo)
where
    F: FnMut(u32) -> Result<T, SystemError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut info = RetryInfo::default();
    let mut delay = policy.base_delay();

    loop {
        info.attempts += 1;
        match op(info.attempts) {
            Ok(value) => {
                info.succeeded = true;
                return (Ok(value), info);
            }
            Err(err) => {
                let message = err.to_string();
                info.errors.push(message.clone());

                if !policy.is_retryable(&message) {
                    debug!("Attempt {} failed permanently: {}", info.attempts, message);
                    return (Err(err), info);
                }
                if info.attempts >= max_attempts {
                    return (
                        Err(SystemError::RetryExhausted {
                            attempts: info.attempts,
                            last_error: message,
                        }),
                        info,
                    );
                }

                debug!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    info.attempts, max_attempts, message, delay
                );
                std::thread::sleep(delay);
                info.delays_ms.push(delay.as_millis() as u64);
                delay = policy.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(5))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay(), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(6), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn test_constant_policy() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100)).constant();
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(100));
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.classify("connection reset by peer"), ErrorClass::Retryable);
        assert_eq!(policy.classify("Request timed out"), ErrorClass::Retryable);
        assert_eq!(policy.classify("HTTP 503"), ErrorClass::Retryable);
        assert_eq!(policy.classify("parse error at line 3"), ErrorClass::NonRetryable);
        assert_eq!(policy.classify("Unauthorized"), ErrorClass::NonRetryable);
        // Non-retryable wins when both match
        assert_eq!(policy.classify("invalid response: timeout"), ErrorClass::NonRetryable);
        assert_eq!(policy.classify("something odd"), ErrorClass::Retryable);
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let (result, info) = retry_with_backoff(&fast_policy(), |attempt| {
            if attempt < 3 {
                Err(SystemError::Pipeline("network unreachable".to_string()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(info.attempts, 3);
        assert!(info.succeeded);
        assert_eq!(info.delays_ms, vec![5, 10]);
        assert_eq!(info.errors.len(), 2);
    }

    #[test]
    fn test_exhausts_attempts() {
        let (result, info) = retry_with_backoff::<(), _>(&fast_policy(), |_| {
            Err(SystemError::Pipeline("service unavailable".to_string()))
        });
        match result {
            Err(SystemError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(info.attempts, 3);
        assert!(!info.succeeded);
    }

    #[test]
    fn test_permanent_error_stops_immediately() {
        let (result, info) = retry_with_backoff::<(), _>(&fast_policy(), |_| {
            Err(SystemError::Pipeline("invalid record".to_string()))
        });
        assert!(matches!(result, Err(SystemError::Pipeline(_))));
        assert_eq!(info.attempts, 1);
        assert!(info.delays_ms.is_empty());
    }

    #[test]
    fn test_merge_override() {
        let base = RetryPolicy::default();
        let merged = base.merged(&RetryPolicyOverride {
            max_attempts: Some(5),
            base_delay_ms: Some(100),
            ..Default::default()
        });
        assert_eq!(merged.max_attempts, 5);
        assert_eq!(merged.base_delay_ms, 100);
        assert_eq!(merged.max_delay_ms, base.max_delay_ms);
        assert!(merged.exponential);
    }
}
