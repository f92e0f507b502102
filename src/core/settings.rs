//! Validation settings and the settings collaborator.
//!
//! Settings are plain serde structs loaded from TOML or JSON. Every section
//! has defaults, so a partial file (or no file at all) yields a usable
//! configuration.

use crate::core::error::{SettingsError, SettingsResult};
use crate::core::events::EventBus;
use crate::core::types::{Aspect, Severity};
use crossbeam::channel::Receiver;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

/// Complete settings snapshot used for one validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Monotonic version, bumped by the settings owner.
    pub version: u32,
    /// Which aspects run.
    pub aspects: AspectToggles,
    /// Engine limits and caches.
    pub engine: EngineSettings,
    /// Pipeline limits and caches.
    pub pipeline: PipelineSettings,
    /// Structural aspect.
    pub structural: StructuralSettings,
    /// Profile aspect.
    pub profile: ProfileSettings,
    /// Terminology aspect.
    pub terminology: TerminologySettings,
    /// Reference aspect.
    pub reference: ReferenceSettings,
    /// Business-rule aspect.
    pub business_rules: BusinessRuleSettings,
    /// Metadata aspect.
    pub metadata: MetadataSettings,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            version: 1,
            aspects: AspectToggles::default(),
            engine: EngineSettings::default(),
            pipeline: PipelineSettings::default(),
            structural: StructuralSettings::default(),
            profile: ProfileSettings::default(),
            terminology: TerminologySettings::default(),
            reference: ReferenceSettings::default(),
            business_rules: BusinessRuleSettings::default(),
            metadata: MetadataSettings::default(),
        }
    }
}

impl ValidationSettings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> SettingsResult<Self> {
        let settings: Self = toml::from_str(text).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from JSON text.
    pub fn from_json_str(text: &str) -> SettingsResult<Self> {
        let settings: Self =
            serde_json::from_str(text).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file; `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: impl AsRef<Path>) -> SettingsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> SettingsResult<()> {
        if self.engine.max_concurrent_validations == 0 {
            return Err(SettingsError::Invalid(
                "engine.max_concurrent_validations must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_concurrent == 0 {
            return Err(SettingsError::Invalid(
                "pipeline.max_concurrent must be at least 1".to_string(),
            ));
        }
        let fraction = self.engine.cache_eviction_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(SettingsError::Invalid(format!(
                "engine.cache_eviction_fraction must be in (0, 1], got {}",
                fraction
            )));
        }

        let mut seen = HashSet::new();
        for rule in &self.business_rules.custom_rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate custom rule id '{}'",
                    rule.id
                )));
            }
            if let RuleKind::Pattern { pattern } = &rule.kind {
                regex::Regex::new(pattern).map_err(|e| {
                    SettingsError::Invalid(format!("rule '{}' has a bad pattern: {}", rule.id, e))
                })?;
            }
        }
        Ok(())
    }

    /// Deterministic hash of the whole snapshot, used in cache keys.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(self)
            .unwrap_or_default()
            .hash(&mut hasher);
        hasher.finish()
    }

    /// Whether an aspect is gated on.
    pub fn is_enabled(&self, aspect: Aspect) -> bool {
        self.aspects.get(aspect).enabled
    }
}

/// Per-aspect switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AspectToggles {
    /// Structural aspect.
    pub structural: AspectSettings,
    /// Profile aspect.
    pub profile: AspectSettings,
    /// Terminology aspect.
    pub terminology: AspectSettings,
    /// Reference aspect.
    pub reference: AspectSettings,
    /// Business-rule aspect.
    pub business_rule: AspectSettings,
    /// Metadata aspect.
    pub metadata: AspectSettings,
}

impl AspectToggles {
    /// Settings for one aspect.
    pub fn get(&self, aspect: Aspect) -> &AspectSettings {
        match aspect {
            Aspect::Structural => &self.structural,
            Aspect::Profile => &self.profile,
            Aspect::Terminology => &self.terminology,
            Aspect::Reference => &self.reference,
            Aspect::BusinessRule => &self.business_rule,
            Aspect::Metadata => &self.metadata,
        }
    }

    /// Mutable settings for one aspect.
    pub fn get_mut(&mut self, aspect: Aspect) -> &mut AspectSettings {
        match aspect {
            Aspect::Structural => &mut self.structural,
            Aspect::Profile => &mut self.profile,
            Aspect::Terminology => &mut self.terminology,
            Aspect::Reference => &mut self.reference,
            Aspect::BusinessRule => &mut self.business_rule,
            Aspect::Metadata => &mut self.metadata,
        }
    }
}

impl Default for AspectToggles {
    fn default() -> Self {
        Self {
            structural: AspectSettings::default(),
            profile: AspectSettings::default(),
            terminology: AspectSettings::default(),
            reference: AspectSettings::default(),
            business_rule: AspectSettings::default(),
            metadata: AspectSettings::default(),
        }
    }
}

/// Switch for a single aspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AspectSettings {
    /// Whether the aspect runs.
    pub enabled: bool,
    /// Report every issue of the aspect at this severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_override: Option<Severity>,
}

impl Default for AspectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            severity_override: None,
        }
    }
}

/// Engine limits, caches and circuit breaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Hard cap on in-flight `validate_resource` calls.
    pub max_concurrent_validations: usize,
    /// Run the five dependent aspects in parallel.
    pub parallel_aspects: bool,
    /// Cache full results.
    pub cache_enabled: bool,
    /// Result and lookup cache TTL.
    pub cache_ttl_ms: u64,
    /// Entries per cache before eviction.
    pub cache_capacity: usize,
    /// Fraction of least-recently-used entries evicted once full.
    pub cache_eviction_fraction: f64,
    /// Consecutive failures before a breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker rejects calls.
    pub breaker_cooldown_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_validations: 10,
            parallel_aspects: true,
            cache_enabled: true,
            cache_ttl_ms: 300_000,
            cache_capacity: 1000,
            cache_eviction_fraction: 0.25,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 60_000,
        }
    }
}

impl EngineSettings {
    /// Cache TTL as a duration.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Breaker cooldown as a duration.
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

/// Pipeline limits and caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Records per chunk.
    pub max_concurrent: usize,
    /// Per-record timeout.
    pub record_timeout_ms: u64,
    /// How long a record may wait for an engine admission slot before its
    /// timeout starts.
    pub admission_wait_ms: u64,
    /// Run records of a chunk in parallel.
    pub parallel: bool,
    /// Use the pipeline's own result cache.
    pub cache_enabled: bool,
    /// Pipeline cache TTL.
    pub cache_ttl_ms: u64,
    /// Pipeline cache capacity.
    pub cache_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            record_timeout_ms: 30_000,
            admission_wait_ms: 30_000,
            parallel: true,
            cache_enabled: true,
            cache_ttl_ms: 300_000,
            cache_capacity: 500,
        }
    }
}

/// Structural aspect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralSettings {
    /// Required top-level fields per record type.
    pub required_fields: BTreeMap<String, Vec<String>>,
    /// Report record types without a required-field entry.
    pub flag_unknown_types: bool,
}

impl Default for StructuralSettings {
    fn default() -> Self {
        let entries: [(&str, &[&str]); 11] = [
            ("AllergyIntolerance", &["patient"]),
            ("Condition", &["subject"]),
            ("DiagnosticReport", &["status", "code"]),
            ("Encounter", &["status", "class"]),
            ("MedicationRequest", &["status", "intent", "subject"]),
            ("Observation", &["status", "code"]),
            ("Organization", &["name"]),
            ("Patient", &["name"]),
            ("Practitioner", &["name"]),
            ("Procedure", &["status", "subject"]),
            ("Immunization", &["status", "patient"]),
        ];
        Self {
            required_fields: entries
                .iter()
                .map(|(kind, fields)| {
                    (kind.to_string(), fields.iter().map(|f| f.to_string()).collect())
                })
                .collect(),
            flag_unknown_types: false,
        }
    }
}

/// Profile aspect configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Try to resolve declared profiles.
    pub resolution_enabled: bool,
    /// Servers to resolve profiles against.
    pub resolution_servers: Vec<String>,
}

/// Terminology aspect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminologySettings {
    /// Check codes against the external resolver.
    pub remote_lookup: bool,
    /// Terminology servers, in preference order.
    pub servers: Vec<String>,
    /// Remote lookup timeout.
    pub lookup_timeout_ms: u64,
}

impl Default for TerminologySettings {
    fn default() -> Self {
        Self {
            remote_lookup: false,
            servers: Vec::new(),
            lookup_timeout_ms: 5_000,
        }
    }
}

/// Reference aspect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    /// Detect circular chains through contained records.
    pub check_circular: bool,
    /// Maximum chain depth before a warning.
    pub max_depth: usize,
    /// Accept absolute URLs.
    pub allow_external: bool,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            check_circular: true,
            max_depth: 16,
            allow_external: true,
        }
    }
}

/// Metadata aspect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    /// Warn when `meta.lastUpdated` is absent.
    pub require_last_updated: bool,
    /// Tolerated clock skew for future timestamps, in seconds.
    pub max_future_skew_secs: i64,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            require_last_updated: false,
            max_future_skew_secs: 300,
        }
    }
}

/// Business-rule aspect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessRuleSettings {
    /// Evaluate the built-in per-type invariants.
    pub builtin_rules: bool,
    /// Declarative rules.
    pub custom_rules: Vec<CustomRule>,
}

impl Default for BusinessRuleSettings {
    fn default() -> Self {
        Self {
            builtin_rules: true,
            custom_rules: Vec::new(),
        }
    }
}

/// A declarative rule addressed by a field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRule {
    /// Unique rule id.
    pub id: String,
    /// Path of the field the rule inspects.
    pub path: String,
    /// What the rule checks.
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Severity of violations.
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
    /// Message used for violations.
    #[serde(default)]
    pub message: Option<String>,
    /// Whether the rule is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Record types the rule applies to; empty means all.
    #[serde(default)]
    pub resource_types: Vec<String>,
}

impl CustomRule {
    /// Create an enabled error-severity rule.
    pub fn new(id: impl Into<String>, path: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kind,
            severity: Severity::Error,
            message: None,
            enabled: true,
            resource_types: Vec::new(),
        }
    }

    /// Restrict to a record type.
    pub fn for_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_types.push(resource_type.into());
        self
    }

    /// Set severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the violation message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether the rule applies to a record type.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.enabled
            && (self.resource_types.is_empty()
                || self.resource_types.iter().any(|t| t == resource_type))
    }
}

fn default_rule_severity() -> Severity {
    Severity::Error
}

fn default_true() -> bool {
    true
}

/// Kinds of declarative rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuleKind {
    /// The path must resolve to at least one value.
    Required,
    /// Every string at the path must match a regex.
    Pattern { pattern: String },
    /// A named function from the rule-function registry.
    CustomFunction { function: String },
    /// Number of values at the path.
    Cardinality {
        min: usize,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Codings at the path must come from a code list.
    Terminology {
        #[serde(default)]
        system: Option<String>,
        codes: Vec<String>,
    },
    /// A boolean invariant expression evaluated against the record.
    Invariant { expression: String },
}

/// Settings change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsEvent {
    /// The active settings were edited.
    Changed { version: u32 },
    /// A different settings set was activated.
    Activated { version: u32 },
}

impl SettingsEvent {
    /// Version carried by the event.
    pub fn version(&self) -> u32 {
        match self {
            SettingsEvent::Changed { version } | SettingsEvent::Activated { version } => *version,
        }
    }
}

/// Source of the active validation settings.
pub trait SettingsService: Send + Sync {
    /// Current active settings.
    fn active_settings(&self) -> SettingsResult<ValidationSettings>;

    /// Subscribe to change and activation notifications.
    fn subscribe(&self) -> Receiver<SettingsEvent>;
}

/// In-process settings holder.
pub struct StaticSettingsService {
    current: RwLock<ValidationSettings>,
    events: EventBus<SettingsEvent>,
}

impl StaticSettingsService {
    /// Hold the given settings.
    pub fn new(settings: ValidationSettings) -> Self {
        Self {
            current: RwLock::new(settings),
            events: EventBus::new(),
        }
    }

    /// Replace the active settings and publish `Changed`.
    pub fn update(&self, settings: ValidationSettings) {
        let version = settings.version;
        *self.current.write() = settings;
        self.events.emit(SettingsEvent::Changed { version });
    }

    /// Replace the active settings and publish `Activated`.
    pub fn activate(&self, settings: ValidationSettings) {
        let version = settings.version;
        *self.current.write() = settings;
        self.events.emit(SettingsEvent::Activated { version });
    }
}

impl Default for StaticSettingsService {
    fn default() -> Self {
        Self::new(ValidationSettings::default())
    }
}

impl SettingsService for StaticSettingsService {
    fn active_settings(&self) -> SettingsResult<ValidationSettings> {
        Ok(self.current.read().clone())
    }

    fn subscribe(&self) -> Receiver<SettingsEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = ValidationSettings::default();
        assert_eq!(settings.engine.max_concurrent_validations, 10);
        assert_eq!(settings.engine.breaker_failure_threshold, 5);
        assert!(settings.is_enabled(Aspect::Metadata));
        assert_eq!(
            settings.structural.required_fields.get("Patient"),
            Some(&vec!["name".to_string()])
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            version = 7

            [aspects.terminology]
            enabled = false

            [engine]
            max_concurrent_validations = 3

            [[business_rules.custom_rules]]
            id = "mrn-format"
            path = "identifier.value"
            kind = "pattern"
            pattern = "^MRN-[0-9]+$"
            severity = "warning"
        "#;
        let settings = ValidationSettings::from_toml_str(text).unwrap();
        assert_eq!(settings.version, 7);
        assert!(!settings.is_enabled(Aspect::Terminology));
        assert!(settings.is_enabled(Aspect::Profile));
        assert_eq!(settings.engine.max_concurrent_validations, 3);
        assert_eq!(settings.engine.cache_capacity, 1000);

        let rule = &settings.business_rules.custom_rules[0];
        assert_eq!(rule.severity, Severity::Warning);
        assert!(rule.enabled);
        assert_eq!(
            rule.kind,
            RuleKind::Pattern {
                pattern: "^MRN-[0-9]+$".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let text = r#"
            [[business_rules.custom_rules]]
            id = "broken"
            path = "x"
            kind = "pattern"
            pattern = "(unclosed"
        "#;
        let err = ValidationSettings::from_toml_str(text).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut settings = ValidationSettings::default();
        settings.engine.max_concurrent_validations = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"version": 3, "engine": {{"parallel_aspects": false}}}}"#).unwrap();

        let settings = ValidationSettings::load(file.path()).unwrap();
        assert_eq!(settings.version, 3);
        assert!(!settings.engine.parallel_aspects);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ValidationSettings::load("/nonexistent/pariksha.toml").unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = ValidationSettings::default();
        let mut b = ValidationSettings::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.aspects.get_mut(Aspect::Reference).enabled = false;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_static_service_publishes_changes() {
        let service = StaticSettingsService::default();
        let rx = service.subscribe();

        let mut next = ValidationSettings::default();
        next.version = 2;
        service.update(next.clone());
        next.version = 3;
        service.activate(next);

        assert_eq!(rx.recv().unwrap(), SettingsEvent::Changed { version: 2 });
        assert_eq!(rx.recv().unwrap(), SettingsEvent::Activated { version: 3 });
        assert_eq!(service.active_settings().unwrap().version, 3);
    }
}
