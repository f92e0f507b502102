//! Built-in record-type invariants.
//!
//! These run before custom rules whenever built-in rules are enabled.

use crate::core::record::Record;
use crate::core::types::{Aspect, ValidationIssue};
use crate::validation::rules::parse_datetime;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A built-in rule.
pub struct BuiltinRule {
    /// Rule id reported in issue context.
    pub id: &'static str,
    /// Record type the rule applies to; `None` for every type.
    pub resource_type: Option<&'static str>,
    /// The check.
    pub check: fn(&Record, DateTime<Utc>) -> Vec<ValidationIssue>,
}

/// All built-in rules.
pub const BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        id: "patient-birthdate-not-future",
        resource_type: Some("Patient"),
        check: birth_date_not_future,
    },
    BuiltinRule {
        id: "patient-deceased-exclusive",
        resource_type: Some("Patient"),
        check: deceased_exclusive,
    },
    BuiltinRule {
        id: "period-start-before-end",
        resource_type: None,
        check: period_ordered,
    },
    BuiltinRule {
        id: "observation-value-or-absent-reason",
        resource_type: Some("Observation"),
        check: value_or_absent_reason,
    },
    BuiltinRule {
        id: "medication-request-authored-not-future",
        resource_type: Some("MedicationRequest"),
        check: authored_not_future,
    },
];

/// Run every built-in rule that applies to the record.
pub fn run_builtin_rules(record: &Record, now: DateTime<Utc>) -> Vec<ValidationIssue> {
    BUILTIN_RULES
        .iter()
        .filter(|rule| rule.resource_type.map_or(true, |t| t == record.resource_type()))
        .flat_map(|rule| {
            (rule.check)(record, now)
                .into_iter()
                .map(move |issue| issue.with_context("ruleId", rule.id))
        })
        .collect()
}

fn date_field(record: &Record, field: &str) -> Option<(String, Option<DateTime<Utc>>)> {
    record
        .get_path(field)
        .and_then(Value::as_str)
        .map(|text| (text.to_string(), parse_datetime(text)))
}

fn not_in_future(record: &Record, field: &str, now: DateTime<Utc>, code: &str) -> Vec<ValidationIssue> {
    match date_field(record, field) {
        Some((text, None)) => vec![ValidationIssue::error(
            Aspect::BusinessRule,
            "invalid-date",
            format!("'{}' is not a valid date", text),
        )
        .at(field)],
        Some((text, Some(date))) if date > now => vec![ValidationIssue::error(
            Aspect::BusinessRule,
            code,
            format!("{} {} is in the future", field, text),
        )
        .at(field)],
        _ => Vec::new(),
    }
}

fn birth_date_not_future(record: &Record, now: DateTime<Utc>) -> Vec<ValidationIssue> {
    not_in_future(record, "birthDate", now, "birthdate-in-future")
}

fn authored_not_future(record: &Record, now: DateTime<Utc>) -> Vec<ValidationIssue> {
    not_in_future(record, "authoredOn", now, "authored-in-future")
}

fn deceased_exclusive(record: &Record, _now: DateTime<Utc>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if record.has_field("deceasedBoolean") && record.has_field("deceasedDateTime") {
        issues.push(
            ValidationIssue::error(
                Aspect::BusinessRule,
                "deceased-conflict",
                "Only one of deceasedBoolean and deceasedDateTime may be present",
            )
            .at("deceasedDateTime"),
        );
    }

    let birth = date_field(record, "birthDate").and_then(|(_, d)| d);
    let death = date_field(record, "deceasedDateTime").and_then(|(_, d)| d);
    if let (Some(birth), Some(death)) = (birth, death) {
        if death < birth {
            issues.push(
                ValidationIssue::error(
                    Aspect::BusinessRule,
                    "deceased-before-birth",
                    "deceasedDateTime is before birthDate",
                )
                .at("deceasedDateTime"),
            );
        }
    }
    issues
}

fn period_ordered(record: &Record, _now: DateTime<Utc>) -> Vec<ValidationIssue> {
    let start = date_field(record, "period.start").and_then(|(_, d)| d);
    let end = date_field(record, "period.end").and_then(|(_, d)| d);
    match (start, end) {
        (Some(start), Some(end)) if start > end => vec![ValidationIssue::error(
            Aspect::BusinessRule,
            "period-invalid",
            "period.start is after period.end",
        )
        .at("period")],
        _ => Vec::new(),
    }
}

fn value_or_absent_reason(record: &Record, _now: DateTime<Utc>) -> Vec<ValidationIssue> {
    let has_value = record
        .document()
        .as_object()
        .map_or(false, |map| map.keys().any(|k| k.starts_with("value") && !map[k].is_null()));
    if has_value && record.has_field("dataAbsentReason") {
        vec![ValidationIssue::error(
            Aspect::BusinessRule,
            "value-with-absent-reason",
            "dataAbsentReason must not be present when a value is given",
        )
        .at("dataAbsentReason")]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn codes(document: Value) -> Vec<String> {
        run_builtin_rules(&Record::new(document).unwrap(), now())
            .into_iter()
            .map(|i| i.code)
            .collect()
    }

    #[test]
    fn test_birth_date() {
        assert!(codes(json!({"resourceType": "Patient", "birthDate": "1980-02-03"})).is_empty());
        assert_eq!(
            codes(json!({"resourceType": "Patient", "birthDate": "2030-01-01"})),
            vec!["birthdate-in-future"]
        );
        assert_eq!(
            codes(json!({"resourceType": "Patient", "birthDate": "03/02/1980"})),
            vec!["invalid-date"]
        );
    }

    #[test]
    fn test_deceased() {
        assert_eq!(
            codes(json!({
                "resourceType": "Patient",
                "deceasedBoolean": true,
                "deceasedDateTime": "2020-01-01"
            })),
            vec!["deceased-conflict"]
        );
        assert_eq!(
            codes(json!({
                "resourceType": "Patient",
                "birthDate": "1990-01-01",
                "deceasedDateTime": "1980-01-01"
            })),
            vec!["deceased-before-birth"]
        );
    }

    #[test]
    fn test_period_order() {
        assert_eq!(
            codes(json!({
                "resourceType": "Encounter",
                "period": {"start": "2024-02-01", "end": "2024-01-01"}
            })),
            vec!["period-invalid"]
        );
        assert!(codes(json!({
            "resourceType": "Encounter",
            "period": {"start": "2024-01-01T08:00:00Z", "end": "2024-01-01T09:00:00Z"}
        }))
        .is_empty());
    }

    #[test]
    fn test_observation_value_and_absent_reason() {
        assert_eq!(
            codes(json!({
                "resourceType": "Observation",
                "valueQuantity": {"value": 1},
                "dataAbsentReason": {"text": "unknown"}
            })),
            vec!["value-with-absent-reason"]
        );
        assert!(codes(json!({"resourceType": "Observation", "valueString": "x"})).is_empty());
    }

    #[test]
    fn test_rules_apply_by_type() {
        assert!(codes(json!({"resourceType": "Organization", "birthDate": "2030-01-01"})).is_empty());
    }

    #[test]
    fn test_issues_carry_rule_id() {
        let issues = run_builtin_rules(
            &Record::new(json!({"resourceType": "MedicationRequest", "authoredOn": "2031-01-01"})).unwrap(),
            now(),
        );
        assert_eq!(issues[0].rule_id(), Some("medication-request-authored-not-future"));
    }
}
