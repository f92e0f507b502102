//! Aspect validators and the batch validation pipeline.
//!
//! Each aspect checks one independent dimension of a record. Validators
//! return issues; internal failures (errors or panics) are downgraded to a
//! single issue so one broken rule cannot abort the whole validation.

pub mod business_rule;
pub mod metadata;
pub mod pipeline;
pub mod profile;
pub mod reference;
pub mod rules;
pub mod structural;
pub mod terminology;

pub use business_rule::BusinessRuleValidation;
pub use metadata::MetadataValidation;
pub use pipeline::{PipelineConfig, PipelineResult, ValidationPipeline};
pub use profile::ProfileValidation;
pub use reference::ReferenceValidation;
pub use structural::StructuralValidation;
pub use terminology::TerminologyValidation;

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::Record;
use crate::core::settings::ValidationSettings;
use crate::core::types::{Aspect, ValidationIssue};
use indexmap::IndexMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Issue code for a validator that failed internally.
pub const ASPECT_INTERNAL_ERROR: &str = "aspect-internal-error";

/// Trait for aspect validators.
pub trait AspectValidator: Send + Sync {
    /// The aspect this validator checks.
    fn aspect(&self) -> Aspect;

    /// Validate a record.
    ///
    /// Returns the issues found, or an error if the validator itself failed.
    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError>;
}

/// Run a validator, converting errors and panics into a single issue.
pub fn run_guarded(
    validator: &dyn AspectValidator,
    record: &Record,
    settings: &ValidationSettings,
    ctx: &AspectContext<'_>,
) -> Vec<ValidationIssue> {
    let aspect = validator.aspect();
    let outcome = catch_unwind(AssertUnwindSafe(|| validator.validate(record, settings, ctx)));

    let reason = match outcome {
        Ok(Ok(issues)) => return issues,
        Ok(Err(err)) => err.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "validator panicked".to_string()),
    };

    log::error!("{} validator failed on {}: {}", aspect, ctx.request.label(), reason);
    vec![ValidationIssue::error(
        aspect,
        ASPECT_INTERNAL_ERROR,
        format!("The {} validator failed internally", aspect),
    )
    .with_text(reason.clone())
    .with_context("reason", reason)]
}

/// The set of validators used by an engine, one per aspect.
#[derive(Clone)]
pub struct AspectValidators {
    validators: IndexMap<Aspect, Arc<dyn AspectValidator>>,
}

impl AspectValidators {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            validators: IndexMap::new(),
        }
    }

    /// The six built-in validators.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(StructuralValidation));
        set.register(Arc::new(ProfileValidation));
        set.register(Arc::new(TerminologyValidation));
        set.register(Arc::new(ReferenceValidation));
        set.register(Arc::new(BusinessRuleValidation));
        set.register(Arc::new(MetadataValidation));
        set
    }

    /// Register a validator, replacing any existing one for its aspect.
    pub fn register(&mut self, validator: Arc<dyn AspectValidator>) {
        self.validators.insert(validator.aspect(), validator);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, validator: Arc<dyn AspectValidator>) -> Self {
        self.register(validator);
        self
    }

    /// Validator for an aspect.
    pub fn get(&self, aspect: Aspect) -> Option<&Arc<dyn AspectValidator>> {
        self.validators.get(&aspect)
    }

    /// Number of registered validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether no validators are registered.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl Default for AspectValidators {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::AspectResources;
    use crate::core::types::ValidationRequest;
    use serde_json::json;

    struct Exploding;

    impl AspectValidator for Exploding {
        fn aspect(&self) -> Aspect {
            Aspect::Reference
        }

        fn validate(
            &self,
            _record: &Record,
            _settings: &ValidationSettings,
            _ctx: &AspectContext<'_>,
        ) -> Result<Vec<ValidationIssue>, AspectError> {
            panic!("rule table corrupted")
        }
    }

    struct Failing;

    impl AspectValidator for Failing {
        fn aspect(&self) -> Aspect {
            Aspect::Profile
        }

        fn validate(
            &self,
            _record: &Record,
            _settings: &ValidationSettings,
            _ctx: &AspectContext<'_>,
        ) -> Result<Vec<ValidationIssue>, AspectError> {
            Err(AspectError::Internal("lookup table missing".to_string()))
        }
    }

    fn request() -> ValidationRequest {
        ValidationRequest::new(Record::new(json!({"resourceType": "Patient"})).unwrap())
    }

    #[test]
    fn test_builtins_cover_all_aspects() {
        let set = AspectValidators::with_builtins();
        assert_eq!(set.len(), 6);
        for aspect in Aspect::ALL {
            assert_eq!(set.get(aspect).unwrap().aspect(), aspect);
        }
    }

    #[test]
    fn test_register_replaces() {
        let set = AspectValidators::with_builtins().with(Arc::new(Failing));
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn test_panics_become_one_issue() {
        let resources = AspectResources::new();
        let request = request();
        let ctx = resources.context(&request);
        let issues = run_guarded(&Exploding, &request.record, &ValidationSettings::default(), &ctx);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].aspect, Aspect::Reference);
        assert_eq!(issues[0].code, ASPECT_INTERNAL_ERROR);
        assert!(issues[0].text.contains("rule table corrupted"));
    }

    #[test]
    fn test_errors_become_one_issue() {
        let resources = AspectResources::new();
        let request = request();
        let ctx = resources.context(&request);
        let issues = run_guarded(&Failing, &request.record, &ValidationSettings::default(), &ctx);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].aspect, Aspect::Profile);
        assert!(issues[0].severity.is_error());
    }
}
