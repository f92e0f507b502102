//! Reference validation - links to other records.
//!
//! Every `reference` string in the record is classified and checked.
//! Local (`#id`) references are resolved against the contained records, and
//! the links between contained records are analyzed as a graph:
//! - Cycles among contained records are errors
//! - Chains deeper than the configured limit are warnings

use crate::core::context::AspectContext;
use crate::core::error::AspectError;
use crate::core::record::{walk_objects, Record};
use crate::core::settings::ValidationSettings;
use crate::core::types::{Aspect, ValidationIssue};
use crate::validation::AspectValidator;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::Instant;

/// Classification of a reference string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `#id` pointing at a contained record; empty for the container itself.
    Fragment(String),
    /// `Type/id`, optionally versioned.
    Relative {
        /// Target record type.
        resource_type: String,
        /// Target id.
        id: String,
    },
    /// Absolute URL or URN.
    Absolute(String),
    /// Not a recognizable reference.
    Invalid,
}

fn relative_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Z][A-Za-z]+)/([A-Za-z0-9\-\.]{1,64})(/_history/[A-Za-z0-9\-\.]{1,64})?$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Classify a reference string.
pub fn classify(reference: &str) -> ReferenceKind {
    if let Some(fragment) = reference.strip_prefix('#') {
        return ReferenceKind::Fragment(fragment.to_string());
    }
    if reference.starts_with("http://") || reference.starts_with("https://") || reference.starts_with("urn:") {
        return if reference.chars().any(char::is_whitespace) {
            ReferenceKind::Invalid
        } else {
            ReferenceKind::Absolute(reference.to_string())
        };
    }
    match relative_pattern().captures(reference) {
        Some(caps) => ReferenceKind::Relative {
            resource_type: caps[1].to_string(),
            id: caps[2].to_string(),
        },
        None => ReferenceKind::Invalid,
    }
}

/// A reference found in the record.
struct Found {
    path: String,
    value: String,
    kind: ReferenceKind,
}

/// Node of the contained-reference graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Node {
    Container,
    Contained(usize),
}

/// Reference validation.
pub struct ReferenceValidation;

impl AspectValidator for ReferenceValidation {
    fn aspect(&self) -> Aspect {
        Aspect::Reference
    }

    fn validate(
        &self,
        record: &Record,
        settings: &ValidationSettings,
        ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let config = &settings.reference;
        let mut issues = Vec::new();
        let mut found = Vec::new();

        walk_objects(record.document(), &mut |path, map| match map.get("reference") {
            None | Some(Value::Null) => {}
            Some(Value::String(value)) => {
                let kind = classify_cached(value, ctx);
                found.push(Found {
                    path: join(path, "reference"),
                    value: value.clone(),
                    kind,
                });
            }
            Some(_) => issues.push(
                ValidationIssue::error(
                    Aspect::Reference,
                    "reference-invalid-type",
                    "reference must be a string",
                )
                .at(&join(path, "reference")),
            ),
        });

        let contained_ids: HashMap<&str, usize> = record
            .contained()
            .into_iter()
            .enumerate()
            .filter_map(|(i, item)| item.get("id").and_then(Value::as_str).map(|id| (id, i)))
            .collect();

        for reference in &found {
            match &reference.kind {
                ReferenceKind::Invalid => issues.push(
                    ValidationIssue::error(
                        Aspect::Reference,
                        "reference-invalid",
                        format!("'{}' is not a valid reference", reference.value),
                    )
                    .at(&reference.path),
                ),
                ReferenceKind::Absolute(url) if !config.allow_external => issues.push(
                    ValidationIssue::error(
                        Aspect::Reference,
                        "reference-external",
                        format!("External reference '{}' is not allowed", url),
                    )
                    .at(&reference.path),
                ),
                ReferenceKind::Relative { resource_type, id }
                    if resource_type == record.resource_type() && Some(id.as_str()) == record.id() =>
                {
                    issues.push(
                        ValidationIssue::warning(
                            Aspect::Reference,
                            "reference-self",
                            "Record references itself",
                        )
                        .at(&reference.path),
                    )
                }
                ReferenceKind::Fragment(id) if !id.is_empty() && !contained_ids.contains_key(id.as_str()) => {
                    issues.push(
                        ValidationIssue::error(
                            Aspect::Reference,
                            "reference-broken",
                            format!("No contained record with id '{}'", id),
                        )
                        .at(&reference.path),
                    )
                }
                _ => {}
            }
        }

        if config.check_circular && !contained_ids.is_empty() {
            let graph = build_graph(&found, &contained_ids);
            check_graph(&graph, record, config.max_depth, &mut issues);
        }

        Ok(issues)
    }
}

fn classify_cached(value: &str, ctx: &AspectContext<'_>) -> ReferenceKind {
    let key = value.to_string();
    if let Some(kind) = ctx.caches.references.get(&key) {
        return kind;
    }
    let start = Instant::now();
    let kind = classify(value);
    ctx.caches.references.put(key, kind.clone(), start.elapsed());
    kind
}

/// Owner of a reference path: the contained record it sits in, if any.
fn owner(path: &str) -> Node {
    path.strip_prefix("contained[")
        .and_then(|rest| rest.split(']').next())
        .and_then(|index| index.parse().ok())
        .map_or(Node::Container, Node::Contained)
}

fn build_graph(found: &[Found], contained_ids: &HashMap<&str, usize>) -> DiGraphMap<Node, ()> {
    let mut graph = DiGraphMap::new();
    graph.add_node(Node::Container);
    for index in contained_ids.values() {
        graph.add_node(Node::Contained(*index));
    }
    for reference in found {
        if let ReferenceKind::Fragment(id) = &reference.kind {
            if let Some(target) = contained_ids.get(id.as_str()) {
                graph.add_edge(owner(&reference.path), Node::Contained(*target), ());
            }
        }
    }
    graph
}

fn check_graph(graph: &DiGraphMap<Node, ()>, record: &Record, max_depth: usize, issues: &mut Vec<ValidationIssue>) {
    let contained = record.contained();
    let label = |node: Node| match node {
        Node::Container => "#".to_string(),
        Node::Contained(i) => contained
            .get(i)
            .and_then(|item| item.get("id"))
            .and_then(Value::as_str)
            .map(|id| format!("#{}", id))
            .unwrap_or_else(|| format!("contained[{}]", i)),
    };

    let mut cyclic: HashSet<Node> = HashSet::new();
    for component in tarjan_scc(graph) {
        let is_cycle = component.len() > 1
            || component.first().map_or(false, |n| graph.contains_edge(*n, *n));
        if !is_cycle {
            continue;
        }
        let mut members = component.clone();
        members.sort();
        let chain: Vec<String> = members.iter().map(|n| label(*n)).collect();
        let first = members[0];
        issues.push(
            ValidationIssue::error(
                Aspect::Reference,
                "reference-circular",
                format!("Circular reference chain: {}", chain.join(" -> ")),
            )
            .with_context("chain", chain)
            .at(&match first {
                Node::Container => String::new(),
                Node::Contained(i) => format!("contained[{}]", i),
            }),
        );
        cyclic.extend(members);
    }

    if !cyclic.is_empty() {
        return;
    }

    // Acyclic: longest chain from the container by dynamic programming.
    let Ok(order) = toposort(graph, None) else {
        return;
    };
    let mut depth: HashMap<Node, usize> = HashMap::new();
    for node in order {
        let d = graph
            .neighbors_directed(node, Direction::Incoming)
            .filter_map(|parent| depth.get(&parent).map(|p| p + 1))
            .max()
            .unwrap_or(0);
        depth.insert(node, d);
    }
    let deepest = depth.values().copied().max().unwrap_or(0);
    if deepest > max_depth {
        issues.push(
            ValidationIssue::warning(
                Aspect::Reference,
                "reference-chain-too-deep",
                format!("Reference chain depth {} exceeds limit {}", deepest, max_depth),
            )
            .at("contained"),
        );
    }
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::AspectResources;
    use crate::core::types::{Severity, ValidationRequest};
    use serde_json::json;

    fn run(document: Value, settings: &ValidationSettings) -> Vec<ValidationIssue> {
        let request = ValidationRequest::new(Record::new(document).unwrap());
        let resources = AspectResources::new();
        let ctx = resources.context(&request);
        ReferenceValidation
            .validate(&request.record, settings, &ctx)
            .unwrap()
    }

    fn codes(issues: &[ValidationIssue]) -> Vec<&str> {
        issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("#med1"), ReferenceKind::Fragment("med1".to_string()));
        assert_eq!(
            classify("Patient/123"),
            ReferenceKind::Relative { resource_type: "Patient".to_string(), id: "123".to_string() }
        );
        assert!(matches!(classify("Patient/123/_history/2"), ReferenceKind::Relative { .. }));
        assert!(matches!(classify("https://example.org/Patient/1"), ReferenceKind::Absolute(_)));
        assert_eq!(classify("patient 123"), ReferenceKind::Invalid);
        assert_eq!(classify("Patient/"), ReferenceKind::Invalid);
    }

    #[test]
    fn test_valid_references_pass() {
        let issues = run(
            json!({
                "resourceType": "Observation",
                "subject": {"reference": "Patient/p1"},
                "performer": [{"reference": "https://example.org/Practitioner/9"}]
            }),
            &ValidationSettings::default(),
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn test_invalid_and_self_references() {
        let issues = run(
            json!({
                "resourceType": "Patient",
                "id": "p1",
                "link": [{"other": {"reference": "Patient/p1"}}],
                "generalPractitioner": [{"reference": "not a reference"}]
            }),
            &ValidationSettings::default(),
        );
        let found = codes(&issues);
        assert!(found.contains(&"reference-self"));
        assert!(found.contains(&"reference-invalid"));
    }

    #[test]
    fn test_external_disallowed() {
        let mut settings = ValidationSettings::default();
        settings.reference.allow_external = false;
        let issues = run(
            json!({"resourceType": "Observation", "subject": {"reference": "http://x.org/Patient/1"}}),
            &settings,
        );
        assert_eq!(codes(&issues), vec!["reference-external"]);
    }

    #[test]
    fn test_broken_fragment() {
        let issues = run(
            json!({
                "resourceType": "MedicationRequest",
                "medicationReference": {"reference": "#missing"},
                "contained": [{"resourceType": "Medication", "id": "med1"}]
            }),
            &ValidationSettings::default(),
        );
        assert_eq!(codes(&issues), vec!["reference-broken"]);
        assert_eq!(issues[0].path(), "medicationReference.reference");
    }

    #[test]
    fn test_circular_contained_chain() {
        let issues = run(
            json!({
                "resourceType": "Observation",
                "hasMember": [{"reference": "#a"}],
                "contained": [
                    {"resourceType": "Observation", "id": "a", "hasMember": [{"reference": "#b"}]},
                    {"resourceType": "Observation", "id": "b", "hasMember": [{"reference": "#a"}]}
                ]
            }),
            &ValidationSettings::default(),
        );
        assert_eq!(codes(&issues), vec!["reference-circular"]);
        assert_eq!(issues[0].severity, Severity::Error);
        assert!(issues[0].message.contains("#a -> #b"));
    }

    #[test]
    fn test_chain_depth_limit() {
        let mut settings = ValidationSettings::default();
        settings.reference.max_depth = 1;
        let issues = run(
            json!({
                "resourceType": "Observation",
                "hasMember": [{"reference": "#a"}],
                "contained": [
                    {"resourceType": "Observation", "id": "a", "hasMember": [{"reference": "#b"}]},
                    {"resourceType": "Observation", "id": "b"}
                ]
            }),
            &settings,
        );
        assert_eq!(codes(&issues), vec!["reference-chain-too-deep"]);
    }

    #[test]
    fn test_circular_check_can_be_disabled() {
        let mut settings = ValidationSettings::default();
        settings.reference.check_circular = false;
        let issues = run(
            json!({
                "resourceType": "Observation",
                "contained": [
                    {"resourceType": "Observation", "id": "a", "hasMember": [{"reference": "#a"}]}
                ]
            }),
            &settings,
        );
        assert!(issues.is_empty());
    }
}
