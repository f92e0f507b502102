//! Validation engine implementation.
//!
//! The engine validates one record at a time against the active settings:
//! - Admission control rejects calls beyond the concurrency cap, or waits
//!   for a released slot when the caller asks to
//! - Structural validation runs first, the other aspects after it, either
//!   in parallel (rayon) or sequentially
//! - Results are cached by record content and settings fingerprint
//! - External lookups go through the shared circuit breakers
//! - Settings-derived state (cap, breaker thresholds, the HTTP terminology
//!   resolver) is re-applied whenever the settings fingerprint changes

use crate::core::context::AspectResources;
use crate::core::error::{SystemError, SystemResult};
use crate::core::events::EventBus;
use crate::core::services::{PoolHealth, ResultsStore, ValidatorPool};
use crate::core::settings::{SettingsService, ValidationSettings};
use crate::core::types::{Aspect, AspectResult, ValidationRequest, ValidationResult, ValidationTiming};
use crate::execution::cache::{CacheKey, CacheStats, EngineCaches};
use crate::execution::circuit::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry, Transition};
use crate::execution::retry::{retry_with_backoff, RetryPolicy};
use crate::validation::rules::RuleFunctionRegistry;
use crate::validation::terminology::{HttpTerminologyResolver, TerminologyResolver};
use crate::validation::{run_guarded, AspectValidator, AspectValidators};
use crossbeam::channel::Receiver;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// One aspect finished for a record.
    AspectCompleted {
        /// Correlation id of the request.
        request_id: String,
        /// The aspect.
        aspect: Aspect,
        /// Wall time of the aspect.
        duration_ms: u64,
        /// Issues it produced.
        issue_count: usize,
        /// Whether it passed.
        passed: bool,
    },
    /// A record finished validating.
    ValidationCompleted {
        /// Correlation id of the request.
        request_id: String,
        /// Record type.
        resource_type: String,
        /// Overall validity.
        is_valid: bool,
        /// Overall score.
        score: u32,
        /// Wall time of the validation.
        duration_ms: u64,
        /// Served from the result cache.
        cached: bool,
    },
    /// A validation failed with a hard error.
    ValidationError {
        /// Correlation id of the request.
        request_id: String,
        /// Stable error code.
        code: String,
        /// Error message.
        message: String,
    },
    /// A circuit breaker opened.
    CircuitOpened {
        /// External service name.
        service: String,
    },
    /// A circuit breaker closed after a successful trial.
    CircuitClosed {
        /// External service name.
        service: String,
    },
    /// Settings could not be loaded; defaults were used.
    DegradedSettings {
        /// Why the settings were unavailable.
        reason: String,
    },
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Validations currently in flight.
    pub active_validations: usize,
    /// Current admission cap.
    pub max_concurrent: usize,
    /// Validations completed, including cache hits.
    pub completed: u64,
    /// Validations rejected or failed.
    pub failed: u64,
    /// Statistics of each cache, by name.
    pub caches: Vec<(&'static str, CacheStats)>,
    /// Breaker states.
    pub breakers: Vec<BreakerSnapshot>,
}

/// An admitted validation.
#[derive(Debug, Clone)]
struct ActiveValidation {
    label: String,
    started: Instant,
}

/// Releases an admission slot when dropped and wakes one waiter.
struct AdmissionGuard<'a> {
    engine: &'a ValidationEngine,
    id: Uuid,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.engine.active.lock().remove(&self.id) {
            debug!("Released {} after {:?}", entry.label, entry.started.elapsed());
        }
        self.engine.released.notify_one();
    }
}

/// The validation engine.
pub struct ValidationEngine {
    /// Source of active settings.
    settings: Arc<dyn SettingsService>,
    /// One validator per aspect.
    validators: AspectValidators,
    /// Caches, breakers, rule functions and resolver.
    resources: AspectResources,
    /// Admitted validations.
    active: Mutex<HashMap<Uuid, ActiveValidation>>,
    /// Signalled whenever a slot is released or the cap grows.
    released: Condvar,
    /// Admission cap.
    max_concurrent: AtomicUsize,
    /// Fingerprint of the settings last applied to the cap and breakers.
    applied_settings: Mutex<u64>,
    /// Resolver built from the terminology settings.
    settings_resolver: RwLock<Option<Arc<dyn TerminologyResolver>>>,
    /// Published events.
    events: Arc<EventBus<EngineEvent>>,
    /// Optional results sink.
    store: Option<Arc<dyn ResultsStore>>,
    /// Optional external validator pool.
    pool: Option<Arc<dyn ValidatorPool>>,
    /// Default policy for retrying validations.
    retry_policy: RetryPolicy,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ValidationEngine {
    /// Create an engine reading settings from `settings`.
    ///
    /// Caches are sized from the settings active at construction. The cap,
    /// breaker thresholds and terminology resolver follow later settings
    /// changes on the next validation after the change.
    pub fn new(settings: Arc<dyn SettingsService>) -> Self {
        let events = Arc::new(EventBus::new());
        let initial = settings.active_settings().unwrap_or_else(|err| {
            warn!("Settings unavailable at startup ({}), using defaults", err);
            ValidationSettings::default()
        });
        let engine_settings = &initial.engine;

        let hook_events = events.clone();
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: engine_settings.breaker_failure_threshold,
            cooldown: engine_settings.breaker_cooldown(),
        })
        .with_transition_hook(move |service, transition| {
            let service = service.to_string();
            hook_events.emit(match transition {
                Transition::Opened => EngineEvent::CircuitOpened { service },
                Transition::Closed => EngineEvent::CircuitClosed { service },
            });
        });

        let resources = AspectResources {
            caches: EngineCaches::new(
                engine_settings.cache_capacity,
                engine_settings.cache_ttl(),
                engine_settings.cache_eviction_fraction,
            ),
            breakers: Arc::new(breakers),
            functions: RuleFunctionRegistry::with_builtins(),
            terminology: None,
        };

        Self {
            max_concurrent: AtomicUsize::new(engine_settings.max_concurrent_validations.max(1)),
            applied_settings: Mutex::new(initial.fingerprint()),
            settings_resolver: RwLock::new(resolver_from_settings(&initial)),
            settings,
            validators: AspectValidators::with_builtins(),
            resources,
            active: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            events,
            store: None,
            pool: None,
            retry_policy: RetryPolicy::default(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Replace the validator for one aspect.
    pub fn with_validator(mut self, validator: Arc<dyn AspectValidator>) -> Self {
        self.validators.register(validator);
        self
    }

    /// Replace the rule-function registry.
    pub fn with_functions(mut self, functions: RuleFunctionRegistry) -> Self {
        self.resources.functions = functions;
        self
    }

    /// Use a terminology resolver for remote code lookups.
    ///
    /// Takes precedence over the resolver built from the settings.
    pub fn with_terminology_resolver(mut self, resolver: Arc<dyn TerminologyResolver>) -> Self {
        self.resources.terminology = Some(resolver);
        self
    }

    /// Hand every result to a store.
    pub fn with_results_store(mut self, store: Arc<dyn ResultsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach an external validator pool for health reporting.
    pub fn with_pool(mut self, pool: Arc<dyn ValidatorPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the default retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The settings collaborator.
    pub fn settings_service(&self) -> Arc<dyn SettingsService> {
        self.settings.clone()
    }

    /// Active settings, falling back to defaults when unavailable.
    pub fn active_settings(&self) -> ValidationSettings {
        self.load_settings()
    }

    /// Shared resources lent to validators.
    pub fn resources(&self) -> &AspectResources {
        &self.resources
    }

    /// Change the admission cap.
    ///
    /// The cap holds until the active settings change; the next validation
    /// after a change re-applies `engine.max_concurrent_validations`.
    pub fn set_max_concurrent(&self, limit: usize) {
        self.max_concurrent.store(limit.max(1), Ordering::SeqCst);
        // Waiters may fit under a raised cap
        self.released.notify_all();
    }

    /// Current admission cap.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Validations currently in flight.
    pub fn active_validations(&self) -> usize {
        self.active.lock().len()
    }

    /// Validate one record.
    ///
    /// Fails immediately with [`SystemError::AdmissionLimitExceeded`] when
    /// the cap is reached. Soft findings are returned as issues, never as
    /// errors.
    pub fn validate_resource(&self, request: &ValidationRequest) -> SystemResult<ValidationResult> {
        self.validate_admitted(request, self.admit(request, Duration::ZERO), || {})
    }

    /// Validate one record, waiting up to `wait` for an admission slot.
    ///
    /// `on_admitted` runs once the slot is held, before any aspect starts.
    /// Fails with [`SystemError::AdmissionLimitExceeded`] if no slot frees
    /// up in time.
    pub fn validate_resource_waiting<F>(
        &self,
        request: &ValidationRequest,
        wait: Duration,
        on_admitted: F,
    ) -> SystemResult<ValidationResult>
    where
        F: FnOnce(),
    {
        self.validate_admitted(request, self.admit(request, wait), on_admitted)
    }

    fn validate_admitted<F>(
        &self,
        request: &ValidationRequest,
        admission: SystemResult<AdmissionGuard<'_>>,
        on_admitted: F,
    ) -> SystemResult<ValidationResult>
    where
        F: FnOnce(),
    {
        let outcome = admission.map(|_guard| {
            on_admitted();
            let start = Instant::now();
            let settings = self.load_settings();
            self.apply_engine_settings(&settings);
            self.run_validation(request, &settings, start)
        });

        match &outcome {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(EngineEvent::ValidationError {
                    request_id: request.context.request_id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        }
        outcome
    }

    /// Validate many records, at most the admission cap at a time.
    ///
    /// Records are processed chunk by chunk; each chunk runs in parallel when
    /// parallel aspects are enabled and sequentially otherwise. Results are
    /// returned in input order.
    pub fn validate_resources(&self, requests: &[ValidationRequest]) -> Vec<SystemResult<ValidationResult>> {
        let parallel = self.load_settings().engine.parallel_aspects;
        let chunk_size = self.max_concurrent();
        let mut results = Vec::with_capacity(requests.len());

        for chunk in requests.chunks(chunk_size) {
            if parallel {
                let chunk_results: Vec<_> = chunk.par_iter().map(|r| self.validate_resource(r)).collect();
                results.extend(chunk_results);
            } else {
                results.extend(chunk.iter().map(|r| self.validate_resource(r)));
            }
        }
        results
    }

    /// Validate one record, retrying transient failures.
    ///
    /// Uses `policy` or the engine's default. The attempt trace is attached
    /// to the returned result.
    pub fn validate_resource_with_retry(
        &self,
        request: &ValidationRequest,
        policy: Option<&RetryPolicy>,
    ) -> SystemResult<ValidationResult> {
        let policy = policy.unwrap_or(&self.retry_policy);
        let (outcome, info) = retry_with_backoff(policy, |attempt| {
            if attempt > 1 {
                debug!("Retrying {} (attempt {})", request.label(), attempt);
            }
            self.validate_resource(request)
        });
        outcome.map(|mut result| {
            result.retry_info = Some(info);
            result
        })
    }

    /// Health of the attached validator pool.
    pub fn pool_health(&self) -> Option<PoolHealth> {
        self.pool.as_deref().map(PoolHealth::from_pool)
    }

    /// Drop every cached result and lookup.
    pub fn clear_cache(&self) {
        self.resources.caches.clear();
        info!("Engine caches cleared");
    }

    /// Get engine statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_validations: self.active_validations(),
            max_concurrent: self.max_concurrent(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            caches: self.resources.caches.stats(),
            breakers: self.resources.breakers.snapshot(),
        }
    }

    fn admit(&self, request: &ValidationRequest, wait: Duration) -> SystemResult<AdmissionGuard<'_>> {
        let deadline = Instant::now() + wait;
        let mut active = self.active.lock();
        while active.len() >= self.max_concurrent() && Instant::now() < deadline {
            self.released.wait_until(&mut active, deadline);
        }

        let limit = self.max_concurrent();
        if active.len() >= limit {
            debug!("Rejected {}: {} in flight", request.label(), active.len());
            return Err(SystemError::AdmissionLimitExceeded {
                active: active.len(),
                limit,
            });
        }

        let id = Uuid::new_v4();
        active.insert(
            id,
            ActiveValidation {
                label: request.label(),
                started: Instant::now(),
            },
        );
        Ok(AdmissionGuard { engine: self, id })
    }

    fn load_settings(&self) -> ValidationSettings {
        let loaded = self
            .settings
            .active_settings()
            .and_then(|settings| settings.validate().map(|_| settings));
        match loaded {
            Ok(settings) => settings,
            Err(err) => {
                warn!("Settings unavailable ({}), validating with defaults", err);
                self.events.emit(EngineEvent::DegradedSettings {
                    reason: err.to_string(),
                });
                ValidationSettings::default()
            }
        }
    }

    /// Re-apply settings-derived state if the settings changed since the
    /// last application.
    fn apply_engine_settings(&self, settings: &ValidationSettings) {
        let fingerprint = settings.fingerprint();
        {
            let mut applied = self.applied_settings.lock();
            if *applied == fingerprint {
                return;
            }
            *applied = fingerprint;
        }

        debug!("Applying settings version {}", settings.version);
        self.set_max_concurrent(settings.engine.max_concurrent_validations);
        self.resources.breakers.reconfigure(CircuitBreakerConfig {
            failure_threshold: settings.engine.breaker_failure_threshold,
            cooldown: settings.engine.breaker_cooldown(),
        });
        *self.settings_resolver.write() = resolver_from_settings(settings);
    }

    /// Result-cache key of a request under the given settings.
    pub(crate) fn cache_key(request: &ValidationRequest, settings: &ValidationSettings) -> CacheKey {
        let mut hasher = DefaultHasher::new();
        settings.fingerprint().hash(&mut hasher);
        request.profile_url.hash(&mut hasher);
        CacheKey::new(request.record.document(), hasher.finish())
    }

    fn run_validation(&self, request: &ValidationRequest, settings: &ValidationSettings, start: Instant) -> ValidationResult {
        let caching = settings.engine.cache_enabled;
        let key = Self::cache_key(request, settings);

        if caching {
            if let Some(cached) = self.resources.caches.results.get(&key) {
                debug!("Cache hit for {}", request.label());
                self.emit_completed(request, &cached, start, true);
                return cached;
            }
        }

        let settings_resolver = self.settings_resolver.read().clone();
        let mut ctx = self.resources.context(request);
        if ctx.terminology.is_none() {
            ctx.terminology = settings_resolver.as_deref();
        }
        let run = |aspect: Aspect| -> (Aspect, AspectResult, Option<u64>) {
            if !settings.is_enabled(aspect) {
                return (aspect, AspectResult::disabled(), None);
            }
            let Some(validator) = self.validators.get(aspect) else {
                return (aspect, AspectResult::disabled(), None);
            };

            let aspect_start = Instant::now();
            let mut issues = run_guarded(validator.as_ref(), &request.record, settings, &ctx);
            if let Some(severity) = settings.aspects.get(aspect).severity_override {
                for issue in &mut issues {
                    issue.severity = severity;
                }
            }
            let result = AspectResult::from_issues(issues);
            let duration_ms = aspect_start.elapsed().as_millis() as u64;

            self.events.emit(EngineEvent::AspectCompleted {
                request_id: request.context.request_id.clone(),
                aspect,
                duration_ms,
                issue_count: result.issues.len(),
                passed: result.passed,
            });
            (aspect, result, Some(duration_ms))
        };

        // Structural runs first and always; the rest may run in parallel.
        let mut outcomes = vec![run(Aspect::Structural)];
        if settings.engine.parallel_aspects {
            let rest: Vec<_> = Aspect::DEPENDENT.par_iter().map(|aspect| run(*aspect)).collect();
            outcomes.extend(rest);
        } else {
            outcomes.extend(Aspect::DEPENDENT.iter().map(|aspect| run(*aspect)));
        }

        let mut aspects = BTreeMap::new();
        let mut timing = ValidationTiming::default();
        for (aspect, result, duration_ms) in outcomes {
            if let Some(ms) = duration_ms {
                timing.per_aspect_ms.insert(aspect, ms);
            }
            aspects.insert(aspect, result);
        }
        timing.total_ms = start.elapsed().as_millis() as u64;

        let result = ValidationResult::aggregate(request, aspects, timing);

        if caching {
            self.resources
                .caches
                .results
                .put(key, result.clone(), start.elapsed());
        }
        if let Some(store) = &self.store {
            store.store(&result);
        }
        self.emit_completed(request, &result, start, false);
        result
    }

    fn emit_completed(&self, request: &ValidationRequest, result: &ValidationResult, start: Instant, cached: bool) {
        self.events.emit(EngineEvent::ValidationCompleted {
            request_id: request.context.request_id.clone(),
            resource_type: result.resource_type.clone(),
            is_valid: result.is_valid,
            score: result.score,
            duration_ms: start.elapsed().as_millis() as u64,
            cached,
        });
    }
}

/// HTTP resolver for the first configured server, when remote lookup is on.
fn resolver_from_settings(settings: &ValidationSettings) -> Option<Arc<dyn TerminologyResolver>> {
    if !settings.terminology.remote_lookup {
        return None;
    }
    HttpTerminologyResolver::from_settings(settings).map(|resolver| Arc::new(resolver) as Arc<dyn TerminologyResolver>)
}
