//! Contracts for external collaborators.
//!
//! The validation core owns no persistence, queue or worker pool. These
//! traits describe what it consumes from the systems around it.

use crate::core::types::{Aspect, Severity, ValidationIssue, ValidationResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Validation work queue.
pub trait QueueService: Send + Sync {
    /// Cancel one queued validation. Returns false if the item was unknown.
    fn cancel_validation(&self, item_id: &str) -> bool;

    /// Cancel every item of a batch. Returns the number of items cancelled.
    fn cancel_batch(&self, batch_id: &str) -> usize;

    /// Ids of queue items that are queued or running.
    fn active_items(&self) -> Vec<String> {
        Vec::new()
    }

    /// Ids of batches with outstanding items.
    fn active_batches(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Per-record progress tracking.
pub trait ProgressService: Send + Sync {
    /// Stop tracking a record's validation. Returns false if unknown.
    fn cancel_resource_progress(&self, resource_id: &str) -> bool;

    /// Ids of records whose validation is in progress.
    fn active_resources(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Control over running batch pipelines.
pub trait PipelineControl: Send + Sync {
    /// Stop a running pipeline. Returns false if it was not running.
    fn cancel_pipeline(&self, pipeline_id: &str) -> bool;

    /// Ids of running pipelines.
    fn active_pipelines(&self) -> Vec<String>;
}

/// Sink for aggregated results.
pub trait ResultsStore: Send + Sync {
    /// Persist one result.
    fn store(&self, result: &ValidationResult);
}

/// Deduplication signature of an issue.
///
/// Hash of `aspect|severity|code|canonicalPath|ruleId|normalizedText`.
pub fn message_signature(issue: &ValidationIssue) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        issue.aspect.as_str(),
        issue.severity.as_str(),
        issue.code,
        canonical_path(&issue.location),
        issue.rule_id().unwrap_or_default(),
        normalize_text(&issue.text),
    );
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// Location without array indices, so `name[0].given` and `name[3].given`
/// collapse together.
pub fn canonical_path(location: &[String]) -> String {
    location
        .iter()
        .map(|segment| match segment.find('[') {
            Some(open) => &segment[..open],
            None => segment.as_str(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Lowercased text with whitespace collapsed and digit runs replaced by `#`.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    let mut last_digit = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
            last_digit = false;
        } else if ch.is_ascii_digit() {
            if !last_digit {
                out.push('#');
            }
            last_digit = true;
            last_space = false;
        } else {
            out.extend(ch.to_lowercase());
            last_space = false;
            last_digit = false;
        }
    }
    out.trim_end().to_string()
}

/// Issues sharing one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueGroup {
    /// Shared signature.
    pub signature: String,
    /// Aspect of the group.
    pub aspect: Aspect,
    /// Severity of the group.
    pub severity: Severity,
    /// Code of the group.
    pub code: String,
    /// A representative message.
    pub message: String,
    /// Number of occurrences.
    pub count: usize,
}

/// Group issues by signature, preserving first-seen order.
pub fn group_by_signature<'a>(issues: impl IntoIterator<Item = &'a ValidationIssue>) -> Vec<IssueGroup> {
    let mut groups: IndexMap<String, IssueGroup> = IndexMap::new();
    for issue in issues {
        let signature = message_signature(issue);
        groups
            .entry(signature.clone())
            .and_modify(|group| group.count += 1)
            .or_insert_with(|| IssueGroup {
                signature,
                aspect: issue.aspect,
                severity: issue.severity,
                code: issue.code.clone(),
                message: issue.message.clone(),
                count: 1,
            });
    }
    groups.into_values().collect()
}

/// Process counts reported by the native validator pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Processes waiting for work.
    pub idle_processes: usize,
    /// All processes.
    pub total_processes: usize,
}

/// External native-validator process pool.
pub trait ValidatorPool: Send + Sync {
    /// Current process counts.
    fn stats(&self) -> PoolStats;

    /// Configured minimum pool size.
    fn min_pool_size(&self) -> usize;
}

/// Derived pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    /// At least one idle process.
    pub ready: bool,
    /// Pool reached its minimum size.
    pub warmed_up: bool,
    /// Raw counts.
    pub stats: PoolStats,
}

impl PoolHealth {
    /// Derive health from a pool.
    pub fn from_pool(pool: &dyn ValidatorPool) -> Self {
        let stats = pool.stats();
        Self {
            ready: stats.idle_processes > 0,
            warmed_up: stats.total_processes >= pool.min_pool_size(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_ignores_indices_and_numbers() {
        let a = ValidationIssue::error(Aspect::Structural, "missing", "Field 3 missing")
            .at("name[0].given");
        let b = ValidationIssue::error(Aspect::Structural, "missing", "field   12 MISSING")
            .at("name[4].given");
        assert_eq!(message_signature(&a), message_signature(&b));

        let c = ValidationIssue::warning(Aspect::Structural, "missing", "Field 3 missing")
            .at("name[0].given");
        assert_ne!(message_signature(&a), message_signature(&c));
    }

    #[test]
    fn test_signature_includes_rule_id() {
        let base = ValidationIssue::error(Aspect::BusinessRule, "rule", "violated");
        let a = base.clone().with_context("ruleId", "r1");
        let b = base.with_context("ruleId", "r2");
        assert_ne!(message_signature(&a), message_signature(&b));
    }

    #[test]
    fn test_group_by_signature() {
        let issues = vec![
            ValidationIssue::error(Aspect::Structural, "a", "x").at("name[0]"),
            ValidationIssue::warning(Aspect::Metadata, "b", "y"),
            ValidationIssue::error(Aspect::Structural, "a", "x").at("name[1]"),
        ];
        let groups = group_by_signature(&issues);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].code, "a");
        assert_eq!(groups[1].count, 1);
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Value 123 is  BAD "), "value # is bad");
    }

    struct FixedPool(PoolStats, usize);

    impl ValidatorPool for FixedPool {
        fn stats(&self) -> PoolStats {
            self.0
        }
        fn min_pool_size(&self) -> usize {
            self.1
        }
    }

    #[test]
    fn test_pool_health() {
        let pool = FixedPool(
            PoolStats {
                idle_processes: 0,
                total_processes: 4,
            },
            2,
        );
        let health = PoolHealth::from_pool(&pool);
        assert!(!health.ready);
        assert!(health.warmed_up);

        let cold = FixedPool(
            PoolStats {
                idle_processes: 1,
                total_processes: 1,
            },
            2,
        );
        let health = PoolHealth::from_pool(&cold);
        assert!(health.ready);
        assert!(!health.warmed_up);
    }
}
