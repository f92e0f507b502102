//! Terminology validation - coded concepts and value sets.
//!
//! Local checks cover the shape of every `coding` array in the record.
//! When remote lookup is enabled, each `system|code` pair is resolved
//! through a [`TerminologyResolver`] behind the `terminology` circuit
//! breaker, with outcomes cached per pair.

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::{walk_objects, Record};
use crate::core::settings::ValidationSettings;
use crate::core::types::{Aspect, ValidationIssue};
use crate::execution::circuit::BreakerError;
use crate::validation::profile::check_canonical_url;
use crate::validation::AspectValidator;
use log::debug;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

/// Breaker name used for remote lookups.
pub const TERMINOLOGY_SERVICE: &str = "terminology";

/// Outcome of resolving a code against a terminology server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeLookup {
    /// The code exists in the system.
    Valid {
        /// Preferred display, if the server returned one.
        display: Option<String>,
    },
    /// The system does not define the code.
    Unknown,
}

/// Resolves codes against an external terminology service.
pub trait TerminologyResolver: Send + Sync {
    /// Look up `code` in `system`.
    fn lookup(&self, system: &str, code: &str) -> Result<CodeLookup, AspectError>;
}

/// Resolver calling `CodeSystem/$validate-code` over HTTP.
pub struct HttpTerminologyResolver {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpTerminologyResolver {
    /// Create a resolver for a server base URL.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolver for the first configured server, if any.
    pub fn from_settings(settings: &ValidationSettings) -> Option<Self> {
        let config = &settings.terminology;
        config
            .servers
            .first()
            .map(|server| Self::new(server.clone(), Duration::from_millis(config.lookup_timeout_ms)))
    }
}

impl TerminologyResolver for HttpTerminologyResolver {
    fn lookup(&self, system: &str, code: &str) -> Result<CodeLookup, AspectError> {
        let url = format!("{}/CodeSystem/$validate-code", self.base_url);
        let response = self
            .agent
            .get(&url)
            .query("url", system)
            .query("code", code)
            .set("Accept", "application/fhir+json")
            .call();

        let body: Value = match response {
            Ok(response) => response.into_json().map_err(|e| AspectError::Lookup {
                service: TERMINOLOGY_SERVICE.to_string(),
                reason: format!("unreadable response: {}", e),
            })?,
            Err(ureq::Error::Status(404, _)) => return Ok(CodeLookup::Unknown),
            Err(ureq::Error::Status(status, _)) => {
                return Err(AspectError::Lookup {
                    service: TERMINOLOGY_SERVICE.to_string(),
                    reason: format!("HTTP {}", status),
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(AspectError::Lookup {
                    service: TERMINOLOGY_SERVICE.to_string(),
                    reason: format!("connection failed: {}", transport),
                })
            }
        };

        Ok(parse_validate_code(&body))
    }
}

/// Read a `$validate-code` Parameters response.
fn parse_validate_code(body: &Value) -> CodeLookup {
    let params = body
        .get("parameter")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let find = |name: &str| params.iter().find(|p| p.get("name").and_then(Value::as_str) == Some(name));

    let result = find("result")
        .and_then(|p| p.get("valueBoolean"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !result {
        return CodeLookup::Unknown;
    }
    CodeLookup::Valid {
        display: find("display")
            .and_then(|p| p.get("valueString"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Terminology validation.
pub struct TerminologyValidation;

impl AspectValidator for TerminologyValidation {
    fn aspect(&self) -> Aspect {
        Aspect::Terminology
    }

    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let mut issues = Vec::new();
        let mut codings: Vec<(String, &Map<String, Value>)> = Vec::new();

        walk_objects(record.document(), &mut |path, map| {
            if let Some(coding) = map.get("coding") {
                let coding_path = join(path, "coding");
                match coding.as_array() {
                    Some(items) if items.is_empty() => issues.push(
                        ValidationIssue::error(
                            Aspect::Terminology,
                            "coding-empty",
                            "Coded concept has an empty coding list",
                        )
                        .at(&coding_path),
                    ),
                    Some(items) => {
                        for (index, item) in items.iter().enumerate() {
                            let item_path = format!("{}[{}]", coding_path, index);
                            match item.as_object() {
                                Some(entry) => codings.push((item_path, entry)),
                                None => issues.push(
                                    ValidationIssue::error(
                                        Aspect::Terminology,
                                        "coding-invalid",
                                        "Coding entries must be objects",
                                    )
                                    .at(&item_path),
                                ),
                            }
                        }
                    }
                    None => issues.push(
                        ValidationIssue::error(
                            Aspect::Terminology,
                            "coding-invalid",
                            "coding must be an array",
                        )
                        .at(&coding_path),
                    ),
                }
            }

            if let Some(Value::String(value_set)) = map.get("valueSet") {
                if let Err(reason) = check_canonical_url(value_set) {
                    issues.push(
                        ValidationIssue::warning(
                            Aspect::Terminology,
                            "valueset-url-malformed",
                            format!("Value set reference '{}' is malformed", value_set),
                        )
                        .with_text(reason)
                        .at(&join(path, "valueSet")),
                    );
                }
            }
        });

        let mut remote = RemoteLookup::new(settings, ctx);
        for (path, coding) in &codings {
            let code = coding.get("code").and_then(Value::as_str).filter(|c| !c.trim().is_empty());
            let system = coding.get("system").and_then(Value::as_str).filter(|s| !s.trim().is_empty());

            if code.is_none() {
                issues.push(
                    ValidationIssue::error(Aspect::Terminology, "code-missing", "Coding has no code")
                        .at(&join(path, "code")),
                );
            }
            match system {
                None => issues.push(
                    ValidationIssue::warning(
                        Aspect::Terminology,
                        "system-missing",
                        "Coding has no system; the code cannot be interpreted",
                    )
                    .at(&join(path, "system")),
                ),
                Some(system) => {
                    if let Some(code) = code {
                        let display = coding.get("display").and_then(Value::as_str);
                        remote.check(system, code, display, path, &mut issues);
                    }
                }
            }
        }

        Ok(issues)
    }
}

/// Per-record state of remote lookups.
struct RemoteLookup<'a> {
    ctx: &'a AspectContext<'a>,
    enabled: bool,
    reported_unavailable: bool,
}

impl<'a> RemoteLookup<'a> {
    fn new(settings: &ValidationSettings, ctx: &'a AspectContext<'a>) -> Self {
        Self {
            ctx,
            enabled: settings.terminology.remote_lookup,
            reported_unavailable: false,
        }
    }

    fn check(
        &mut self,
        system: &str,
        code: &str,
        display: Option<&str>,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if !self.enabled || self.reported_unavailable {
            return;
        }
        let Some(resolver) = self.ctx.terminology else {
            issues.push(ValidationIssue::warning(
                Aspect::Terminology,
                "terminology-lookup-unconfigured",
                "Remote code lookup is enabled but no terminology server is configured",
            ));
            self.reported_unavailable = true;
            return;
        };

        let key = format!("{}|{}", system, code);
        let lookup = match self.ctx.caches.terminology.get(&key) {
            Some(lookup) => lookup,
            None => {
                let start = Instant::now();
                match self
                    .ctx
                    .breakers
                    .call(TERMINOLOGY_SERVICE, || resolver.lookup(system, code))
                {
                    Ok(lookup) => {
                        self.ctx.caches.terminology.put(key, lookup.clone(), start.elapsed());
                        lookup
                    }
                    Err(BreakerError::Open { .. }) => {
                        issues.push(ValidationIssue::information(
                            Aspect::Terminology,
                            "terminology-unavailable",
                            "Terminology service is unavailable; remote code checks were skipped",
                        ));
                        self.reported_unavailable = true;
                        return;
                    }
                    Err(BreakerError::Inner(err)) => {
                        debug!("Lookup of {} failed: {}", key, err);
                        issues.push(
                            ValidationIssue::warning(
                                Aspect::Terminology,
                                "terminology-lookup-failed",
                                format!("Could not verify code '{}' in '{}'", code, system),
                            )
                            .with_text(err.to_string())
                            .at(path),
                        );
                        return;
                    }
                }
            }
        };

        match lookup {
            CodeLookup::Unknown => issues.push(
                ValidationIssue::error(
                    Aspect::Terminology,
                    "code-unknown",
                    format!("Code '{}' is not defined in '{}'", code, system),
                )
                .with_context("system", system)
                .with_context("code", code)
                .at(&join(path, "code")),
            ),
            CodeLookup::Valid {
                display: Some(expected),
            } => {
                if let Some(actual) = display {
                    if !actual.eq_ignore_ascii_case(&expected) {
                        issues.push(
                            ValidationIssue::information(
                                Aspect::Terminology,
                                "display-mismatch",
                                format!("Display '{}' differs from '{}'", actual, expected),
                            )
                            .at(&join(path, "display")),
                        );
                    }
                }
            }
            CodeLookup::Valid { display: None } => {}
        }
    }
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}
