//! Business-rule validation - record-type invariants and custom rules.
//!
//! Built-in invariants run first when enabled, followed by every custom
//! rule from the settings that applies to the record type. A rule that
//! cannot be evaluated (bad pattern, unknown function, unparsable
//! expression) yields one `rule-invalid` issue and the remaining rules
//! still run.

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::Record;
use crate::core::settings::{CustomRule, RuleKind, ValidationSettings};
use crate::core::types::{Aspect, Severity, ValidationIssue};
use crate::execution::cache::hash_value;
use crate::validation::rules::builtin::run_builtin_rules;
use crate::validation::rules::Expression;
use crate::validation::AspectValidator;
use regex::Regex;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

/// Business-rule validation.
pub struct BusinessRuleValidation;

impl AspectValidator for BusinessRuleValidation {
    fn aspect(&self) -> Aspect {
        Aspect::BusinessRule
    }

    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let config = &settings.business_rules;
        let mut issues = Vec::new();

        if config.builtin_rules {
            issues.extend(run_builtin_rules(record, ctx.now));
        }

        for rule in &config.custom_rules {
            if !rule.applies_to(record.resource_type()) {
                continue;
            }

            let key = (rule.id.clone(), outcome_key(rule, record));
            if ctx.caches.rules.get(&key) == Some(true) {
                continue;
            }

            let start = Instant::now();
            let found = match evaluate(rule, record, ctx) {
                Ok(found) => found,
                Err(err) => {
                    log::warn!("Custom rule '{}' could not be evaluated: {}", rule.id, err);
                    issues.push(
                        ValidationIssue::error(
                            Aspect::BusinessRule,
                            "rule-invalid",
                            format!("Rule '{}' could not be evaluated", rule.id),
                        )
                        .with_text(err.to_string())
                        .with_context("ruleId", rule.id.as_str()),
                    );
                    continue;
                }
            };
            ctx.caches.rules.put(key, found.is_empty(), start.elapsed());
            issues.extend(found);
        }

        Ok(issues)
    }
}

/// Hash of the rule definition and the values it inspects.
fn outcome_key(rule: &CustomRule, record: &Record) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(rule).unwrap_or_default().hash(&mut hasher);
    match &rule.kind {
        // Invariants may read any field.
        RuleKind::Invariant { .. } => hash_value(record.document(), &mut hasher),
        _ => {
            for value in record.select(&rule.path) {
                hash_value(value, &mut hasher);
            }
        }
    }
    hasher.finish()
}

fn violation(rule: &CustomRule, code: &str, default_message: String) -> ValidationIssue {
    let message = rule.message.clone().unwrap_or(default_message);
    ValidationIssue::new(Aspect::BusinessRule, rule.severity, code, message)
        .with_context("ruleId", rule.id.as_str())
        .at(&rule.path)
}

fn evaluate(rule: &CustomRule, record: &Record, ctx: &AspectContext<'_>) -> Result<Vec<ValidationIssue>, AspectError> {
    let values = record.select(&rule.path);
    let invalid = |reason: String| AspectError::InvalidRule {
        rule_id: rule.id.clone(),
        reason,
    };

    let issues = match &rule.kind {
        RuleKind::Required => {
            if values.is_empty() {
                vec![violation(rule, "rule-required", format!("'{}' is required", rule.path))]
            } else {
                Vec::new()
            }
        }
        RuleKind::Pattern { pattern } => {
            let regex = Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
            values
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !regex.is_match(s))
                .map(|s| {
                    violation(
                        rule,
                        "rule-pattern",
                        format!("'{}' does not match pattern '{}'", s, pattern),
                    )
                    .with_context("value", s)
                })
                .collect()
        }
        RuleKind::CustomFunction { function } => {
            let f = ctx
                .functions
                .get(function)
                .ok_or_else(|| invalid(format!("unknown function '{}'", function)))?;
            values
                .iter()
                .filter(|v| !f(**v))
                .map(|_| {
                    violation(
                        rule,
                        "rule-function",
                        format!("'{}' failed check '{}'", rule.path, function),
                    )
                })
                .collect()
        }
        RuleKind::Cardinality { min, max } => {
            let count = values.len();
            let too_many = max.map_or(false, |max| count > max);
            if count < *min || too_many {
                let bound = match max {
                    Some(max) => format!("{}..{}", min, max),
                    None => format!("{}..*", min),
                };
                vec![violation(
                    rule,
                    "rule-cardinality",
                    format!("'{}' has {} values, expected {}", rule.path, count, bound),
                )]
            } else {
                Vec::new()
            }
        }
        RuleKind::Terminology { system, codes } => codings(&values)
            .into_iter()
            .filter(|(coding_system, code)| {
                let system_ok = match system {
                    Some(expected) => coding_system.as_deref() == Some(expected.as_str()),
                    None => true,
                };
                !(system_ok && codes.iter().any(|c| c == code))
            })
            .map(|(_, code)| {
                violation(
                    rule,
                    "rule-terminology",
                    format!("Code '{}' is not allowed at '{}'", code, rule.path),
                )
                .with_context("code", code)
            })
            .collect(),
        RuleKind::Invariant { expression } => {
            let parsed = Expression::parse(expression).map_err(|e| invalid(e.to_string()))?;
            if parsed.evaluate(record.document()) {
                Vec::new()
            } else {
                vec![violation(
                    rule,
                    "rule-invariant",
                    format!("Invariant '{}' failed", parsed.source()),
                )]
            }
        }
    };
    Ok(issues)
}

/// `(system, code)` pairs from codes, codings and coded concepts.
fn codings(values: &[&Value]) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::String(code) => out.push((None, code.clone())),
            Value::Object(map) => {
                let entries: Vec<&Value> = match map.get("coding").and_then(Value::as_array) {
                    Some(items) => items.iter().collect(),
                    None => vec![*value],
                };
                for entry in entries {
                    if let Some(code) = entry.get("code").and_then(Value::as_str) {
                        let system = entry.get("system").and_then(Value::as_str).map(str::to_string);
                        out.push((system, code.to_string()));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Build a warning-severity custom rule.
pub fn warning_rule(id: &str, path: &str, kind: RuleKind) -> CustomRule {
    CustomRule::new(id, path, kind).with_severity(Severity::Warning)
}
