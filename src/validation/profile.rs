//! Profile validation - declared conformance profiles.
//!
//! Profiles are checked for well-formed canonical URLs. Resolving the
//! profile definitions themselves requires configured resolution servers;
//! without them the check degrades to a warning.

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::Record;
use crate::core::settings::ValidationSettings;
use crate::core::types::{Aspect, ValidationIssue};
use crate::validation::AspectValidator;
use serde_json::Value;
use std::time::Instant;

/// Profile validation.
pub struct ProfileValidation;

impl AspectValidator for ProfileValidation {
    fn aspect(&self) -> Aspect {
        Aspect::Profile
    }

    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let mut issues = Vec::new();
        let mut declared = Vec::new();

        match record.get_path("meta.profile") {
            None | Some(Value::Null) => {}
            Some(Value::Array(entries)) => {
                for (index, entry) in entries.iter().enumerate() {
                    let path = format!("meta.profile[{}]", index);
                    match entry.as_str() {
                        Some(url) => {
                            check_url(url, &path, ctx, &mut issues);
                            declared.push(url);
                        }
                        None => issues.push(
                            ValidationIssue::error(
                                Aspect::Profile,
                                "profile-invalid-type",
                                "Profile entries must be strings",
                            )
                            .at(&path),
                        ),
                    }
                }
            }
            Some(_) => issues.push(
                ValidationIssue::error(
                    Aspect::Profile,
                    "profile-invalid-type",
                    "meta.profile must be an array of URLs",
                )
                .at("meta.profile"),
            ),
        }

        if let Some(requested) = ctx.request.profile_url.as_deref() {
            check_url(requested, "meta.profile", ctx, &mut issues);
            if !declared.iter().any(|url| *url == requested) {
                issues.push(
                    ValidationIssue::information(
                        Aspect::Profile,
                        "profile-not-declared",
                        format!("Record does not declare profile '{}'", requested),
                    )
                    .with_context("profile", requested)
                    .at("meta.profile"),
                );
            }
        }

        let has_profiles = !declared.is_empty() || ctx.request.profile_url.is_some();
        if has_profiles
            && settings.profile.resolution_enabled
            && settings.profile.resolution_servers.is_empty()
        {
            issues.push(ValidationIssue::warning(
                Aspect::Profile,
                "profile-resolution-unconfigured",
                "Profile resolution is enabled but no resolution servers are configured",
            ));
        }

        Ok(issues)
    }
}

fn check_url(url: &str, path: &str, ctx: &AspectContext<'_>, issues: &mut Vec<ValidationIssue>) {
    let key = url.to_string();
    let verdict = match ctx.caches.profiles.get(&key) {
        Some(verdict) => verdict,
        None => {
            let start = Instant::now();
            let verdict = check_canonical_url(url);
            ctx.caches.profiles.put(key, verdict.clone(), start.elapsed());
            verdict
        }
    };

    if let Err(reason) = verdict {
        issues.push(
            ValidationIssue::error(
                Aspect::Profile,
                "profile-url-malformed",
                format!("Profile URL '{}' is malformed", url),
            )
            .with_text(reason)
            .with_context("profile", url)
            .at(path),
        );
    }
}

/// Check that a canonical URL is absolute `http(s)` with a host, or a URN.
pub fn check_canonical_url(url: &str) -> Result<(), String> {
    if url.trim() != url || url.is_empty() {
        return Err("URL is empty or has surrounding whitespace".to_string());
    }
    if url.chars().any(char::is_whitespace) {
        return Err("URL contains whitespace".to_string());
    }
    if let Some(rest) = url.strip_prefix("urn:") {
        return if rest.contains(':') {
            Ok(())
        } else {
            Err("URN must have a namespace and a value".to_string())
        };
    }

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| "URL must start with http://, https:// or urn:".to_string())?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err("URL has no host".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::AspectResources;
    use crate::core::types::{Severity, ValidationRequest};
    use serde_json::json;

    fn run(request: &ValidationRequest, settings: &ValidationSettings, resources: &AspectResources) -> Vec<ValidationIssue> {
        let ctx = resources.context(request);
        ProfileValidation
            .validate(&request.record, settings, &ctx)
            .unwrap()
    }

    fn request(document: Value) -> ValidationRequest {
        ValidationRequest::new(Record::new(document).unwrap())
    }

    #[test]
    fn test_url_checks() {
        assert!(check_canonical_url("http://example.org/fhir/StructureDefinition/x").is_ok());
        assert!(check_canonical_url("urn:oid:1.2.3").is_ok());
        assert!(check_canonical_url("example.org/profile").is_err());
        assert!(check_canonical_url("https:///nohost").is_err());
        assert!(check_canonical_url("http://a b").is_err());
    }

    #[test]
    fn test_no_profiles_no_issues() {
        let resources = AspectResources::new();
        let req = request(json!({"resourceType": "Patient"}));
        assert!(run(&req, &ValidationSettings::default(), &resources).is_empty());
    }

    #[test]
    fn test_malformed_and_non_string_entries() {
        let resources = AspectResources::new();
        let req = request(json!({
            "resourceType": "Patient",
            "meta": {"profile": ["not a url", 4, "http://example.org/p"]}
        }));
        let issues = run(&req, &ValidationSettings::default(), &resources);
        let codes: Vec<_> = issues.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["profile-url-malformed", "profile-invalid-type"]);
    }

    #[test]
    fn test_requested_profile_not_declared() {
        let resources = AspectResources::new();
        let req = request(json!({"resourceType": "Patient"})).with_profile("http://example.org/p");
        let issues = run(&req, &ValidationSettings::default(), &resources);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Information);
    }

    #[test]
    fn test_resolution_without_servers_warns() {
        let resources = AspectResources::new();
        let mut settings = ValidationSettings::default();
        settings.profile.resolution_enabled = true;
        let req = request(json!({
            "resourceType": "Patient",
            "meta": {"profile": ["http://example.org/p"]}
        }));
        let issues = run(&req, &settings, &resources);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "profile-resolution-unconfigured");
    }

    #[test]
    fn test_url_checks_are_cached() {
        let resources = AspectResources::new();
        let req = request(json!({
            "resourceType": "Patient",
            "meta": {"profile": ["http://example.org/p"]}
        }));
        run(&req, &ValidationSettings::default(), &resources);
        run(&req, &ValidationSettings::default(), &resources);
        assert_eq!(resources.caches.profiles.stats().hits, 1);
    }
}
