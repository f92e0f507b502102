//! Registry of named functions for custom-function rules.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// A rule function: returns whether one value satisfies the rule.
pub type RuleFunction = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Registry entry for a rule function.
#[derive(Clone)]
pub struct FunctionEntry {
    /// The function.
    pub function: RuleFunction,
    /// Human-readable description.
    pub description: String,
}

/// Registry for named rule functions.
///
/// Custom-function rules refer to entries here by name. Names are unique;
/// registering a name again replaces the previous entry.
#[derive(Clone)]
pub struct RuleFunctionRegistry {
    functions: IndexMap<String, FunctionEntry>,
}

impl RuleFunctionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            functions: IndexMap::new(),
        }
    }

    /// Create a registry pre-populated with built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("non_empty", "Value is not empty", |value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            _ => true,
        });
        registry.register("is_uuid", "Value is a UUID string", |value| {
            value
                .as_str()
                .map(|s| uuid::Uuid::parse_str(s.trim_start_matches("urn:uuid:")).is_ok())
                .unwrap_or(false)
        });
        registry.register("is_positive", "Value is a number above zero", |value| {
            match value {
                Value::Number(n) => n.as_f64().map_or(false, |v| v > 0.0),
                Value::Object(map) => map
                    .get("value")
                    .and_then(Value::as_f64)
                    .map_or(false, |v| v > 0.0),
                _ => false,
            }
        });
        registry
    }

    /// Register a function.
    pub fn register<F>(&mut self, name: impl Into<String>, description: impl Into<String>, function: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.functions.insert(
            name.into(),
            FunctionEntry {
                function: Arc::new(function),
                description: description.into(),
            },
        );
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&RuleFunction> {
        self.functions.get(name).map(|e| &e.function)
    }

    /// Check if a function is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for RuleFunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins() {
        let registry = RuleFunctionRegistry::with_builtins();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["non_empty", "is_uuid", "is_positive"]);

        let non_empty = registry.get("non_empty").unwrap();
        assert!(non_empty(&json!("x")));
        assert!(!non_empty(&json!("  ")));
        assert!(!non_empty(&json!([])));

        let is_uuid = registry.get("is_uuid").unwrap();
        assert!(is_uuid(&json!("urn:uuid:6f1c3e8a-2b7d-4c59-9a1e-0d6b4c2f7e10")));
        assert!(!is_uuid(&json!("abc")));

        let is_positive = registry.get("is_positive").unwrap();
        assert!(is_positive(&json!(3)));
        assert!(is_positive(&json!({"value": 72, "unit": "bpm"})));
        assert!(!is_positive(&json!(-1)));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = RuleFunctionRegistry::with_builtins();
        registry.register("non_empty", "always false", |_| false);
        assert_eq!(registry.len(), 3);
        assert!(!registry.get("non_empty").unwrap()(&json!("x")));
    }
}
