//! Context handed to aspect validators.
//!
//! Contexts give validators access to the request being validated and to
//! the engine-owned shared resources: lookup caches, circuit breakers, the
//! terminology resolver and named rule functions.

use crate::core::types::ValidationRequest;
use crate::execution::cache::EngineCaches;
use crate::execution::circuit::CircuitBreakerRegistry;
use crate::validation::rules::functions::RuleFunctionRegistry;
use crate::validation::terminology::TerminologyResolver;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared resources owned by the engine and lent to each validation.
pub struct AspectResources {
    /// Lookup caches.
    pub caches: EngineCaches,
    /// Breakers for external services.
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Named functions for custom-function rules.
    pub functions: RuleFunctionRegistry,
    /// External terminology resolver.
    pub terminology: Option<Arc<dyn TerminologyResolver>>,
}

impl AspectResources {
    /// Resources with default caches and breakers and the built-in functions.
    pub fn new() -> Self {
        Self {
            caches: EngineCaches::default(),
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            functions: RuleFunctionRegistry::with_builtins(),
            terminology: None,
        }
    }

    /// Borrow a context for one request.
    pub fn context<'a>(&'a self, request: &'a ValidationRequest) -> AspectContext<'a> {
        AspectContext {
            request,
            caches: &self.caches,
            breakers: &self.breakers,
            functions: &self.functions,
            terminology: self.terminology.as_deref(),
            now: Utc::now(),
        }
    }
}

impl Default for AspectResources {
    fn default() -> Self {
        Self::new()
    }
}

/// Context provided to an aspect validator for one record.
#[derive(Clone, Copy)]
pub struct AspectContext<'a> {
    /// The request being validated.
    pub request: &'a ValidationRequest,
    /// Lookup caches.
    pub caches: &'a EngineCaches,
    /// Breakers for external services.
    pub breakers: &'a CircuitBreakerRegistry,
    /// Named rule functions.
    pub functions: &'a RuleFunctionRegistry,
    /// External terminology resolver, if configured.
    pub terminology: Option<&'a dyn TerminologyResolver>,
    /// Reference time for date checks.
    pub now: DateTime<Utc>,
}

impl<'a> std::fmt::Debug for AspectContext<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AspectContext")
            .field("request", &self.request.label())
            .field("terminology", &self.terminology.map(|_| "<resolver>"))
            .field("now", &self.now)
            .finish()
    }
}
