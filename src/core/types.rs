//! Core value types for record validation.
//!
//! This module defines the data model that flows through the engine:
//! - Issue severities and the six validation aspects
//! - Individual validation issues
//! - Per-aspect and overall validation results
//! - Scoring helpers shared by the engine and the pipeline

use crate::core::record::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Score penalty per error (fatal issues weigh the same).
pub const ERROR_WEIGHT: u32 = 15;
/// Score penalty per warning.
pub const WARNING_WEIGHT: u32 = 5;
/// Score penalty per informational issue.
pub const INFORMATION_WEIGHT: u32 = 1;
/// Maximum score.
pub const MAX_SCORE: u32 = 100;

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Unrecoverable problem with the record.
    Fatal,
    /// The record violates a rule.
    Error,
    /// Suspicious but permitted content.
    Warning,
    /// Informational note.
    Information,
}

impl Severity {
    /// Whether this severity fails its aspect.
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Fatal | Severity::Error)
    }

    /// Lowercase name used in signatures and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Fatal => "fatal",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Information => "information",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independent validation dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aspect {
    /// Required fields and basic shape.
    Structural,
    /// Declared profile references.
    Profile,
    /// Coded concepts and value sets.
    Terminology,
    /// Cross-record references.
    Reference,
    /// Record-type invariants and custom rules.
    BusinessRule,
    /// Housekeeping fields.
    Metadata,
}

impl Aspect {
    /// All aspects, structural first.
    pub const ALL: [Aspect; 6] = [
        Aspect::Structural,
        Aspect::Profile,
        Aspect::Terminology,
        Aspect::Reference,
        Aspect::BusinessRule,
        Aspect::Metadata,
    ];

    /// The aspects that run after the structural pass.
    pub const DEPENDENT: [Aspect; 5] = [
        Aspect::Profile,
        Aspect::Terminology,
        Aspect::Reference,
        Aspect::BusinessRule,
        Aspect::Metadata,
    ];

    /// Wire name of the aspect.
    pub fn as_str(&self) -> &'static str {
        match self {
            Aspect::Structural => "structural",
            Aspect::Profile => "profile",
            Aspect::Terminology => "terminology",
            Aspect::Reference => "reference",
            Aspect::BusinessRule => "businessRule",
            Aspect::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Aspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding produced by an aspect validator.
///
/// Issues are soft results: they are aggregated into a [`ValidationResult`]
/// and never raised as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Issue severity.
    pub severity: Severity,
    /// Machine-readable code, e.g. `required-field-missing`.
    pub code: String,
    /// Short message.
    pub message: String,
    /// Longer human-readable text.
    pub text: String,
    /// Path segments locating the offending element.
    pub location: Vec<String>,
    /// Aspect that produced the issue.
    pub aspect: Aspect,
    /// Optional structured context (rule id, offending value, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, serde_json::Value>>,
}

impl ValidationIssue {
    /// Create a new issue.
    pub fn new(
        aspect: Aspect,
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            severity,
            code: code.into(),
            text: message.clone(),
            message,
            location: Vec::new(),
            aspect,
            context: None,
        }
    }

    /// Create an error issue.
    pub fn error(aspect: Aspect, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(aspect, Severity::Error, code, message)
    }

    /// Create a warning issue.
    pub fn warning(aspect: Aspect, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(aspect, Severity::Warning, code, message)
    }

    /// Create an informational issue.
    pub fn information(aspect: Aspect, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(aspect, Severity::Information, code, message)
    }

    /// Set the location from a dotted path such as `name[0].given`.
    pub fn at(mut self, path: &str) -> Self {
        self.location = path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Set the location from explicit segments.
    pub fn at_segments(mut self, segments: Vec<String>) -> Self {
        self.location = segments;
        self
    }

    /// Override the human-readable text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Attach a context value.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Dotted form of the location.
    pub fn path(&self) -> String {
        self.location.join(".")
    }

    /// Rule id recorded in the context, if any.
    pub fn rule_id(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|ctx| ctx.get("ruleId"))
            .and_then(|value| value.as_str())
    }
}

/// Error/warning/information tallies for a set of issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    /// Fatal and error issues.
    pub errors: usize,
    /// Warnings.
    pub warnings: usize,
    /// Informational issues.
    pub information: usize,
}

impl IssueCounts {
    /// Count issues by severity.
    pub fn from_issues<'a>(issues: impl IntoIterator<Item = &'a ValidationIssue>) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Fatal | Severity::Error => counts.errors += 1,
                Severity::Warning => counts.warnings += 1,
                Severity::Information => counts.information += 1,
            }
        }
        counts
    }

    /// Score for these counts.
    pub fn score(&self) -> u32 {
        compute_score(self.errors, self.warnings, self.information)
    }
}

/// `clamp(100 - 15*errors - 5*warnings - 1*infos, 0, 100)`.
pub fn compute_score(errors: usize, warnings: usize, information: usize) -> u32 {
    let penalty = (errors as u64) * ERROR_WEIGHT as u64
        + (warnings as u64) * WARNING_WEIGHT as u64
        + (information as u64) * INFORMATION_WEIGHT as u64;
    (MAX_SCORE as u64).saturating_sub(penalty) as u32
}

/// Outcome of a single aspect for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectResult {
    /// True iff the aspect produced no errors.
    pub passed: bool,
    /// Issues produced by the aspect.
    pub issues: Vec<ValidationIssue>,
    /// Number of error and fatal issues.
    pub error_count: usize,
    /// Number of warnings.
    pub warning_count: usize,
    /// Number of informational issues.
    pub information_count: usize,
    /// Aspect score in `[0, 100]`.
    pub score: u32,
    /// Whether the aspect was enabled for this run.
    pub enabled: bool,
}

impl AspectResult {
    /// Build a result from the issues an enabled aspect produced.
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let counts = IssueCounts::from_issues(&issues);
        Self {
            passed: counts.errors == 0,
            error_count: counts.errors,
            warning_count: counts.warnings,
            information_count: counts.information,
            score: counts.score(),
            issues,
            enabled: true,
        }
    }

    /// Result for an aspect that was gated off.
    pub fn disabled() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
            error_count: 0,
            warning_count: 0,
            information_count: 0,
            score: MAX_SCORE,
            enabled: false,
        }
    }
}

/// Timing breakdown for one validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationTiming {
    /// Wall time of the whole validation in milliseconds.
    pub total_ms: u64,
    /// Wall time of each aspect in milliseconds.
    pub per_aspect_ms: BTreeMap<Aspect, u64>,
}

/// Trace of the attempts made by a retrying validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Whether the final attempt succeeded.
    pub succeeded: bool,
    /// Delays waited between attempts, in milliseconds.
    pub delays_ms: Vec<u64>,
    /// Error messages of failed attempts, in order.
    pub errors: Vec<String>,
}

impl RetryInfo {
    /// Total time spent waiting between attempts.
    pub fn total_delay_ms(&self) -> u64 {
        self.delays_ms.iter().sum()
    }
}

/// Who asked for a validation and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Requesting user or system.
    pub requester: Option<String>,
    /// Correlation id of the request.
    pub request_id: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            requester: None,
            request_id: Uuid::new_v4().to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A record submitted for validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// The record itself.
    pub record: Record,
    /// Record type tag.
    pub resource_type: String,
    /// Record id, if known.
    pub resource_id: Option<String>,
    /// Profile the record claims to conform to.
    pub profile_url: Option<String>,
    /// Request context.
    pub context: RequestContext,
}

impl ValidationRequest {
    /// Create a request, taking type and id from the record.
    pub fn new(record: Record) -> Self {
        Self {
            resource_type: record.resource_type().to_string(),
            resource_id: record.id().map(str::to_string),
            profile_url: None,
            context: RequestContext::default(),
            record,
        }
    }

    /// Set the profile to validate against.
    pub fn with_profile(mut self, profile_url: impl Into<String>) -> Self {
        self.profile_url = Some(profile_url.into());
        self
    }

    /// Set the requester.
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.context.requester = Some(requester.into());
        self
    }

    /// Replace the request context.
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// A label for logs: `Type/id` or just the type.
    pub fn label(&self) -> String {
        match &self.resource_id {
            Some(id) => format!("{}/{}", self.resource_type, id),
            None => self.resource_type.clone(),
        }
    }
}

/// Aggregated outcome of validating one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// True iff no aspect produced an error.
    pub is_valid: bool,
    /// Record type.
    pub resource_type: String,
    /// Record id, if any.
    pub resource_id: Option<String>,
    /// Profile validated against, if any.
    pub profile_url: Option<String>,
    /// All issues, in aspect order.
    pub issues: Vec<ValidationIssue>,
    /// Results for all six aspects.
    pub aspects: BTreeMap<Aspect, AspectResult>,
    /// Overall score in `[0, 100]`.
    pub score: u32,
    /// Timing breakdown.
    pub timing: ValidationTiming,
    /// Retry trace, when produced by a retrying call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_info: Option<RetryInfo>,
    /// When the validation finished.
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    /// Aggregate per-aspect results into an overall result.
    ///
    /// Aspects missing from `aspects` are filled in as disabled so all six
    /// keys are always present.
    pub fn aggregate(
        request: &ValidationRequest,
        mut aspects: BTreeMap<Aspect, AspectResult>,
        timing: ValidationTiming,
    ) -> Self {
        for aspect in Aspect::ALL {
            aspects.entry(aspect).or_insert_with(AspectResult::disabled);
        }

        let issues: Vec<ValidationIssue> = Aspect::ALL
            .iter()
            .filter_map(|aspect| aspects.get(aspect))
            .flat_map(|result| result.issues.iter().cloned())
            .collect();
        let counts = IssueCounts::from_issues(&issues);

        Self {
            is_valid: counts.errors == 0,
            resource_type: request.resource_type.clone(),
            resource_id: request.resource_id.clone(),
            profile_url: request.profile_url.clone(),
            score: counts.score(),
            issues,
            aspects,
            timing,
            retry_info: None,
            validated_at: Utc::now(),
        }
    }

    /// A failing result carrying a single synthesized issue.
    ///
    /// Used when a record could not be validated at all (timeouts, engine
    /// failures). The issue counts against its own aspect.
    pub fn synthesized_failure(request: &ValidationRequest, issue: ValidationIssue) -> Self {
        let mut aspects = BTreeMap::new();
        aspects.insert(issue.aspect, AspectResult::from_issues(vec![issue]));
        Self::aggregate(request, aspects, ValidationTiming::default())
    }

    /// Issue counts across all aspects.
    pub fn counts(&self) -> IssueCounts {
        IssueCounts::from_issues(&self.issues)
    }

    /// Result of one aspect.
    ///
    /// An aspect missing from `aspects` (possible for results built by hand
    /// or deserialized) reads as disabled.
    pub fn aspect(&self, aspect: Aspect) -> &AspectResult {
        static MISSING: OnceLock<AspectResult> = OnceLock::new();
        self.aspects
            .get(&aspect)
            .unwrap_or_else(|| MISSING.get_or_init(AspectResult::disabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ValidationRequest {
        let record = Record::new(json!({"resourceType": "Patient", "id": "p1"})).unwrap();
        ValidationRequest::new(record)
    }

    #[test]
    fn test_score_weights() {
        assert_eq!(compute_score(0, 0, 0), 100);
        assert_eq!(compute_score(1, 0, 0), 85);
        assert_eq!(compute_score(0, 1, 0), 95);
        assert_eq!(compute_score(0, 0, 1), 99);
        assert_eq!(compute_score(2, 3, 4), 100 - 30 - 15 - 4);
        assert_eq!(compute_score(7, 0, 0), 0);
        assert_eq!(compute_score(usize::MAX / 16, 0, 0), 0);
    }

    #[test]
    fn test_fatal_counts_as_error() {
        let issues = vec![ValidationIssue::new(Aspect::Structural, Severity::Fatal, "x", "boom")];
        let result = AspectResult::from_issues(issues);
        assert!(!result.passed);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.score, 85);
    }

    #[test]
    fn test_warnings_do_not_fail_aspect() {
        let issues = vec![
            ValidationIssue::warning(Aspect::Terminology, "w", "warn"),
            ValidationIssue::information(Aspect::Terminology, "i", "info"),
        ];
        let result = AspectResult::from_issues(issues);
        assert!(result.passed);
        assert_eq!(result.score, 94);
    }

    #[test]
    fn test_aggregate_fills_all_aspects() {
        let result = ValidationResult::aggregate(&request(), BTreeMap::new(), ValidationTiming::default());
        assert_eq!(result.aspects.len(), 6);
        assert!(result.is_valid);
        assert_eq!(result.score, 100);
        assert!(!result.aspect(Aspect::Metadata).enabled);
    }

    #[test]
    fn test_missing_aspect_reads_as_disabled() {
        let mut result = ValidationResult::aggregate(&request(), BTreeMap::new(), ValidationTiming::default());
        result.aspects.clear();
        assert!(!result.aspect(Aspect::Reference).enabled);

        let mut value = serde_json::to_value(&result).unwrap();
        value["aspects"] = serde_json::json!({});
        let decoded: ValidationResult = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.aspect(Aspect::Terminology).score, MAX_SCORE);
    }

    #[test]
    fn test_issue_location_from_path() {
        let issue = ValidationIssue::error(Aspect::Structural, "c", "m").at("name[0].given");
        assert_eq!(issue.location, vec!["name[0]".to_string(), "given".to_string()]);
        assert_eq!(issue.path(), "name[0].given");
    }

    #[test]
    fn test_aspect_wire_names() {
        let json = serde_json::to_string(&Aspect::BusinessRule).unwrap();
        assert_eq!(json, "\"businessRule\"");
        assert_eq!(Aspect::BusinessRule.to_string(), "businessRule");
    }
}
