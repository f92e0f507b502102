//! # Pariksha - Multi-aspect Record Validation
//!
//! Pariksha validates structured healthcare records along six independent
//! aspects and aggregates the findings into a score and an issue list.
//!
//! ## Features
//!
//! - **Six Aspects**: structural, profile, terminology, reference, business rules and metadata
//! - **Admission Control**: a hard cap on in-flight validations; excess calls fail fast
//! - **Caching**: bounded TTL caches for results and lookups, keyed by record content and settings
//! - **Resilience**: circuit breakers around external services and exponential-backoff retry
//! - **Batch Pipelines**: chunked execution with per-record timeouts and progress events
//! - **Operator Control**: cancellation, scheduled retries and an emergency stop
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pariksha::prelude::*;
//! use std::sync::Arc;
//!
//! let settings = Arc::new(StaticSettingsService::new(ValidationSettings::default()));
//! let engine = ValidationEngine::new(settings);
//!
//! let record = Record::from_json(r#"{"resourceType": "Patient", "id": "p1"}"#).unwrap();
//! let result = engine.validate_resource(&ValidationRequest::new(record)).unwrap();
//!
//! assert!(!result.is_valid);
//! assert_eq!(result.aspect(Aspect::Structural).score, 85);
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`core`]: Records, issues, settings, errors and collaborator contracts
//! - [`validation`]: Aspect validators, the rule engine and the batch pipeline
//! - [`execution`]: The validation engine with caching, circuit breaking and retry
//! - [`control`]: Cancellation and retry ledgers for operators
//!
//! ## Custom Aspects
//!
//! Implement [`AspectValidator`](validation::AspectValidator) to replace a
//! built-in aspect:
//!
//! ```rust,ignore
//! use pariksha::prelude::*;
//!
//! struct NoDrafts;
//!
//! impl AspectValidator for NoDrafts {
//!     fn aspect(&self) -> Aspect {
//!         Aspect::BusinessRule
//!     }
//!
//!     fn validate(
//!         &self,
//!         record: &Record,
//!         _settings: &ValidationSettings,
//!         _ctx: &AspectContext<'_>,
//!     ) -> Result<Vec<ValidationIssue>, AspectError> {
//!         let mut issues = Vec::new();
//!         if record.get_path("status").and_then(|v| v.as_str()) == Some("draft") {
//!             issues.push(ValidationIssue::warning(Aspect::BusinessRule, "draft", "Record is a draft").at("status"));
//!         }
//!         Ok(issues)
//!     }
//! }
//!
//! let engine = ValidationEngine::new(settings).with_validator(Arc::new(NoDrafts));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod core;
pub mod execution;
pub mod validation;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use pariksha::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{
        Aspect, AspectResult, IssueCounts, RequestContext, RetryInfo, Severity, ValidationIssue,
        ValidationRequest, ValidationResult, ValidationTiming,
    };
    pub use crate::core::record::Record;

    // Settings
    pub use crate::core::settings::{
        CustomRule, RuleKind, SettingsEvent, SettingsService, StaticSettingsService, ValidationSettings,
    };

    // Contexts and collaborators
    pub use crate::core::context::{AspectContext, AspectResources};
    pub use crate::core::services::{
        PipelineControl, PoolHealth, ProgressService, QueueService, ResultsStore, ValidatorPool,
    };

    // Errors
    pub use crate::core::error::{
        AspectError, ControlError, RecordError, SettingsError, SystemError, SystemResult,
    };

    // Validation
    pub use crate::validation::pipeline::{
        PipelineConfig, PipelineContext, PipelineEvent, PipelineResult, PipelineStatus, ValidationPipeline,
    };
    pub use crate::validation::rules::RuleFunctionRegistry;
    pub use crate::validation::terminology::{CodeLookup, TerminologyResolver};
    pub use crate::validation::{AspectValidator, AspectValidators};

    // Execution
    pub use crate::execution::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
    pub use crate::execution::engine::{EngineEvent, EngineStats, ValidationEngine};
    pub use crate::execution::retry::{RetryPolicy, RetryPolicyOverride};

    // Control
    pub use crate::control::{
        CancellationRequest, CancellationRetryService, CancellationStatus, ControlEvent, OperationType,
        RetryRequest, RetryStatus, StopSignal,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
