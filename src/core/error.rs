//! Error types for Pariksha.
//!
//! Uses thiserror for structured errors with context. Two families exist:
//! - Soft findings are [`ValidationIssue`](crate::core::types::ValidationIssue)s
//!   and never appear here
//! - Hard failures are [`SystemError`]s, returned to the caller

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Hard failures raised by the engine, pipeline and retry helpers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SystemError {
    /// Too many validations in flight.
    #[error("Admission limit exceeded: {active} in flight (limit {limit})")]
    AdmissionLimitExceeded {
        /// Validations in flight.
        active: usize,
        /// Configured cap.
        limit: usize,
    },

    /// The service breaker is rejecting calls.
    #[error("Circuit breaker open for service '{service}'")]
    CircuitBreakerOpen {
        /// Service name.
        service: String,
    },

    /// A record overran its timeout.
    #[error("Pipeline timeout: {record} did not finish within {timeout_ms} ms")]
    PipelineTimeout {
        /// Record id.
        record: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Every retry attempt failed.
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },

    /// Unexpected pipeline failure.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// The record failed boundary checks.
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SystemError {
    /// Stable code for reporting.
    pub fn code(&self) -> &'static str {
        match self {
            SystemError::AdmissionLimitExceeded { .. } => "ADMISSION_LIMIT_EXCEEDED",
            SystemError::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            SystemError::PipelineTimeout { .. } => "PIPELINE_TIMEOUT",
            SystemError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            SystemError::Pipeline(_) => "PIPELINE_ERROR",
            SystemError::Settings(_) => "SETTINGS_ERROR",
            SystemError::InvalidRecord(_) => "INVALID_RECORD",
            SystemError::Cancelled => "CANCELLED",
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SystemError::AdmissionLimitExceeded { .. }
            | SystemError::CircuitBreakerOpen { .. }
            | SystemError::PipelineTimeout { .. } => true,
            SystemError::Pipeline(message) => {
                crate::execution::retry::RetryPolicy::default().is_retryable(message)
            }
            SystemError::RetryExhausted { .. }
            | SystemError::Settings(_)
            | SystemError::InvalidRecord(_)
            | SystemError::Cancelled => false,
        }
    }
}

/// Errors raised inside an aspect validator.
///
/// These never escape the engine: each one is downgraded to a single issue
/// tagged with the failing aspect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AspectError {
    /// A rule could not be evaluated.
    #[error("Rule '{rule_id}' is invalid: {reason}")]
    InvalidRule {
        /// Offending rule.
        rule_id: String,
        /// What went wrong.
        reason: String,
    },

    /// A remote lookup failed.
    #[error("Lookup against '{service}' failed: {reason}")]
    Lookup {
        /// Service name.
        service: String,
        /// What went wrong.
        reason: String,
    },

    /// Any other validator failure.
    #[error("{0}")]
    Internal(String),
}

/// Errors loading or parsing settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("Failed to read settings from {path}: {reason}")]
    Io {
        /// File path.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Settings text is malformed.
    #[error("Failed to parse settings: {0}")]
    Parse(String),

    /// Settings failed validation.
    #[error("Settings are invalid: {0}")]
    Invalid(String),

    /// The settings service is unreachable.
    #[error("Settings service unavailable: {0}")]
    Unavailable(String),
}

/// Errors checking a record at the boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordError {
    /// The record is not a JSON object.
    #[error("Record must be a JSON object")]
    NotAnObject,

    /// The record has no `resourceType`.
    #[error("Record has no resourceType")]
    MissingResourceType,

    /// `resourceType` is empty or not a string.
    #[error("Record resourceType must be a non-empty string")]
    InvalidResourceType,

    /// The record is not valid JSON.
    #[error("Record is not valid JSON: {0}")]
    Parse(String),
}

/// Errors from synchronous lookups on the cancellation/retry ledgers.
///
/// Operational failures are never reported this way; they are recorded as
/// request status and published as events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No ledger entry has this id.
    #[error("No request with id {0}")]
    UnknownRequest(Uuid),

    /// The entry already finished.
    #[error("Request {id} is already {status}")]
    AlreadyTerminal {
        /// Ledger id.
        id: Uuid,
        /// Terminal status it already holds.
        status: String,
    },
}

/// Result type alias for hard failures.
pub type SystemResult<T> = Result<T, SystemError>;

/// Result type alias for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Result type alias for ledger lookups.
pub type ControlResult<T> = Result<T, ControlError>;
