//! Metadata validation - housekeeping fields.

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::Record;
use crate::core::settings::ValidationSettings;
use crate::core::types::{Aspect, ValidationIssue};
use crate::validation::AspectValidator;
use chrono::{DateTime, Duration};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Metadata validation.
///
/// Verifies:
/// - The record id has the expected format
/// - `meta.lastUpdated` is an instant and not in the future
/// - `meta.versionId` and `meta.source` are non-empty strings
/// - Security labels and tags are complete codings
pub struct MetadataValidation;

impl AspectValidator for MetadataValidation {
    fn aspect(&self) -> Aspect {
        Aspect::Metadata
    }

    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let config = &settings.metadata;
        let mut issues = Vec::new();

        if let Some(id) = record.id() {
            if !id_pattern().is_match(id) {
                issues.push(
                    ValidationIssue::error(
                        Aspect::Metadata,
                        "id-invalid",
                        format!("Id '{}' must be 1-64 letters, digits, '-' or '.'", id),
                    )
                    .at("id"),
                );
            }
        }

        let meta = match record.document().get("meta") {
            Some(Value::Object(meta)) => meta,
            _ => {
                if config.require_last_updated {
                    issues.push(
                        ValidationIssue::warning(
                            Aspect::Metadata,
                            "last-updated-missing",
                            "Record has no meta.lastUpdated",
                        )
                        .at("meta.lastUpdated"),
                    );
                }
                return Ok(issues);
            }
        };

        match meta.get("lastUpdated") {
            None | Some(Value::Null) => {
                if config.require_last_updated {
                    issues.push(
                        ValidationIssue::warning(
                            Aspect::Metadata,
                            "last-updated-missing",
                            "Record has no meta.lastUpdated",
                        )
                        .at("meta.lastUpdated"),
                    );
                }
            }
            Some(Value::String(text)) => match DateTime::parse_from_rfc3339(text) {
                Ok(instant) => {
                    let skew = Duration::seconds(config.max_future_skew_secs);
                    if instant > ctx.now + skew {
                        issues.push(
                            ValidationIssue::warning(
                                Aspect::Metadata,
                                "last-updated-future",
                                format!("meta.lastUpdated {} is in the future", text),
                            )
                            .at("meta.lastUpdated"),
                        );
                    }
                }
                Err(_) => issues.push(
                    ValidationIssue::error(
                        Aspect::Metadata,
                        "last-updated-invalid",
                        format!("meta.lastUpdated '{}' is not a valid instant", text),
                    )
                    .at("meta.lastUpdated"),
                ),
            },
            Some(_) => issues.push(
                ValidationIssue::error(
                    Aspect::Metadata,
                    "last-updated-invalid",
                    "meta.lastUpdated must be a string",
                )
                .at("meta.lastUpdated"),
            ),
        }

        for (field, severity_error) in [("versionId", true), ("source", false)] {
            let Some(value) = meta.get(field) else {
                continue;
            };
            let ok = value.as_str().map_or(false, |s| !s.trim().is_empty());
            if !ok {
                let path = format!("meta.{}", field);
                let message = format!("meta.{} must be a non-empty string", field);
                issues.push(if severity_error {
                    ValidationIssue::error(Aspect::Metadata, "version-id-invalid", message).at(&path)
                } else {
                    ValidationIssue::warning(Aspect::Metadata, "source-invalid", message).at(&path)
                });
            }
        }

        for field in ["security", "tag"] {
            let Some(labels) = meta.get(field) else {
                continue;
            };
            let Some(labels) = labels.as_array() else {
                issues.push(
                    ValidationIssue::error(
                        Aspect::Metadata,
                        "label-invalid",
                        format!("meta.{} must be an array", field),
                    )
                    .at(&format!("meta.{}", field)),
                );
                continue;
            };
            for (index, label) in labels.iter().enumerate() {
                let has = |key: &str| label.get(key).and_then(Value::as_str).map_or(false, |s| !s.is_empty());
                if !has("system") || !has("code") {
                    issues.push(
                        ValidationIssue::warning(
                            Aspect::Metadata,
                            "label-incomplete",
                            format!("meta.{} entries need both system and code", field),
                        )
                        .at(&format!("meta.{}[{}]", field, index)),
                    );
                }
            }
        }

        Ok(issues)
    }
}
