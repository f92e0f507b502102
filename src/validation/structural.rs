//! Structural validation - required fields and basic shape.

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::Record;
use crate::core::settings::ValidationSettings;
use crate::core::types::{Aspect, ValidationIssue};
use crate::validation::AspectValidator;
use serde_json::Value;

/// Issue code for a missing required field.
pub const REQUIRED_FIELD_MISSING: &str = "required-field-missing";

/// Expected JSON kind of a common top-level field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    String,
    Object,
    Array,
}

impl Shape {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::String => value.is_string(),
            Shape::Object => value.is_object(),
            Shape::Array => value.is_array(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Shape::String => "a string",
            Shape::Object => "an object",
            Shape::Array => "an array",
        }
    }
}

const FIELD_SHAPES: &[(&str, Shape)] = &[
    ("id", Shape::String),
    ("implicitRules", Shape::String),
    ("language", Shape::String),
    ("meta", Shape::Object),
    ("text", Shape::Object),
    ("extension", Shape::Array),
    ("modifierExtension", Shape::Array),
    ("contained", Shape::Array),
    ("identifier", Shape::Array),
];

/// Structural validation.
///
/// Verifies:
/// - Fields required for the record type are present and non-empty
/// - Common fields have the expected JSON kind
/// - Contained records are objects with a type
pub struct StructuralValidation;

impl AspectValidator for StructuralValidation {
    fn aspect(&self) -> Aspect {
        Aspect::Structural
    }

    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        _ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let mut issues = Vec::new();
        let resource_type = record.resource_type();
        let config = &settings.structural;

        match config.required_fields.get(resource_type) {
            Some(required) => {
                for field in required {
                    if is_missing(record.get_path(field)) {
                        issues.push(
                            ValidationIssue::error(
                                Aspect::Structural,
                                REQUIRED_FIELD_MISSING,
                                format!("Missing required field '{}'", field),
                            )
                            .with_text(format!(
                                "{} records must have a non-empty '{}'",
                                resource_type, field
                            ))
                            .at(field),
                        );
                    }
                }
            }
            None if config.flag_unknown_types => {
                issues.push(
                    ValidationIssue::information(
                        Aspect::Structural,
                        "unknown-resource-type",
                        format!("No structural definition for '{}'", resource_type),
                    )
                    .at("resourceType"),
                );
            }
            None => {}
        }

        for (field, shape) in FIELD_SHAPES {
            if let Some(value) = record.document().get(*field) {
                if !value.is_null() && !shape.matches(value) {
                    issues.push(
                        ValidationIssue::error(
                            Aspect::Structural,
                            "invalid-field-type",
                            format!("Field '{}' must be {}", field, shape.describe()),
                        )
                        .at(field),
                    );
                }
            }
        }

        for (index, item) in record.contained().into_iter().enumerate() {
            let path = format!("contained[{}]", index);
            match item.as_object() {
                None => issues.push(
                    ValidationIssue::error(
                        Aspect::Structural,
                        "contained-invalid",
                        "Contained entries must be objects",
                    )
                    .at(&path),
                ),
                Some(map) => {
                    let typed = map
                        .get("resourceType")
                        .and_then(Value::as_str)
                        .map_or(false, |t| !t.trim().is_empty());
                    if !typed {
                        issues.push(
                            ValidationIssue::error(
                                Aspect::Structural,
                                "contained-missing-type",
                                "Contained record has no resourceType",
                            )
                            .at(&path),
                        );
                    }
                }
            }
        }

        Ok(issues)
    }
}

/// Absent, null, empty strings, arrays and objects all count as missing.
fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}
