//! End-to-end behaviour of the engine, pipeline and control service.

use crossbeam::channel::{bounded, Receiver};
use pariksha::core::types::compute_score;
use pariksha::execution::circuit::{BreakerError, Transition};
use pariksha::prelude::*;
use pariksha::validation::pipeline::PIPELINE_TIMEOUT;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

fn engine_with(settings: ValidationSettings) -> ValidationEngine {
    ValidationEngine::new(Arc::new(StaticSettingsService::new(settings)))
}

fn request(document: Value) -> ValidationRequest {
    ValidationRequest::new(Record::new(document).unwrap())
}

fn patient(id: &str) -> ValidationRequest {
    request(json!({"resourceType": "Patient", "id": id, "name": [{"family": "Doe"}]}))
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Structural validator that blocks until its gate is dropped.
struct Gated {
    gate: Receiver<()>,
}

impl AspectValidator for Gated {
    fn aspect(&self) -> Aspect {
        Aspect::Structural
    }

    fn validate(
        &self,
        _record: &Record,
        _settings: &ValidationSettings,
        _ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let _ = self.gate.recv();
        Ok(Vec::new())
    }
}

/// Structural validator that records how many calls overlap.
#[derive(Default)]
struct Overlap {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

struct Instrumented(Arc<Overlap>);

impl AspectValidator for Instrumented {
    fn aspect(&self) -> Aspect {
        Aspect::Structural
    }

    fn validate(
        &self,
        _record: &Record,
        _settings: &ValidationSettings,
        _ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        let overlap = &self.0;
        overlap.calls.fetch_add(1, Ordering::SeqCst);
        let now = overlap.current.fetch_add(1, Ordering::SeqCst) + 1;
        overlap.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(15));
        overlap.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Metadata validator that sleeps for one record id.
struct SlowRecord {
    id: &'static str,
    delay: Duration,
}

impl AspectValidator for SlowRecord {
    fn aspect(&self) -> Aspect {
        Aspect::Metadata
    }

    fn validate(
        &self,
        record: &Record,
        _settings: &ValidationSettings,
        _ctx: &AspectContext<'_>,
    ) -> Result<Vec<ValidationIssue>, AspectError> {
        if record.id() == Some(self.id) {
            std::thread::sleep(self.delay);
        }
        Ok(Vec::new())
    }
}

#[test]
fn test_missing_name_is_one_structural_error() {
    let engine = engine_with(ValidationSettings::default());
    let result = engine
        .validate_resource(&request(json!({"resourceType": "Patient", "id": "p1"})))
        .unwrap();

    assert!(!result.is_valid);
    let structural = result.aspect(Aspect::Structural);
    assert_eq!(structural.issues.len(), 1);
    assert_eq!(structural.issues[0].severity, Severity::Error);
    assert_eq!(structural.score, 85);
    assert!(!structural.passed);
}

#[test]
fn test_terminology_warning_keeps_record_valid() {
    let engine = engine_with(ValidationSettings::default());
    let result = engine
        .validate_resource(&request(json!({
            "resourceType": "Observation",
            "id": "o1",
            "status": "final",
            "code": {"coding": [{"code": "8867-4", "display": "Heart rate"}]}
        })))
        .unwrap();

    let terminology = result.aspect(Aspect::Terminology);
    assert!(terminology.passed);
    assert_eq!(terminology.score, 95);
    assert_eq!(terminology.issues.len(), 1);
    assert!(result.is_valid);
}

#[test]
fn test_eleventh_request_is_rejected() {
    let (release, gate) = bounded::<()>(0);
    let engine = engine_with(ValidationSettings::default()).with_validator(Arc::new(Gated { gate }));
    assert_eq!(engine.max_concurrent(), 10);

    std::thread::scope(|scope| {
        let engine = &engine;
        let handles: Vec<_> = (0..10)
            .map(|i| scope.spawn(move || engine.validate_resource(&patient(&format!("p{}", i)))))
            .collect();

        assert!(wait_for(|| engine.active_validations() == 10));
        let started = Instant::now();
        match engine.validate_resource(&patient("p10")) {
            Err(SystemError::AdmissionLimitExceeded { active, limit }) => {
                assert_eq!((active, limit), (10, 10));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        drop(release);
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    });
    assert_eq!(engine.active_validations(), 0);
}

#[test]
fn test_batch_never_exceeds_cap() {
    let mut settings = ValidationSettings::default();
    settings.engine.max_concurrent_validations = 3;
    settings.engine.cache_enabled = false;
    let overlap = Arc::new(Overlap::default());
    let engine = engine_with(settings).with_validator(Arc::new(Instrumented(overlap.clone())));

    let requests: Vec<_> = (0..12).map(|i| patient(&format!("p{}", i))).collect();
    let results = engine.validate_resources(&requests);

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(overlap.calls.load(Ordering::SeqCst), 12);
    assert!(overlap.peak.load(Ordering::SeqCst) <= 3);
}

#[test]
fn test_concurrent_callers_never_exceed_cap() {
    let mut settings = ValidationSettings::default();
    settings.engine.max_concurrent_validations = 4;
    settings.engine.cache_enabled = false;
    let overlap = Arc::new(Overlap::default());
    let engine = engine_with(settings).with_validator(Arc::new(Instrumented(overlap.clone())));

    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let engine = &engine;
        let handles: Vec<_> = (0..16)
            .map(|i| scope.spawn(move || engine.validate_resource(&patient(&format!("p{}", i)))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let admitted = outcomes.iter().filter(|o| o.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|o| matches!(o, Err(SystemError::AdmissionLimitExceeded { .. })))
        .count();
    assert_eq!(admitted + rejected, 16);
    assert_eq!(overlap.calls.load(Ordering::SeqCst), admitted);
    assert!(overlap.peak.load(Ordering::SeqCst) <= 4);
}

#[test]
fn test_pipeline_timeout_spares_siblings() {
    let engine = engine_with(ValidationSettings::default()).with_validator(Arc::new(SlowRecord {
        id: "slow",
        delay: Duration::from_millis(500),
    }));
    let pipeline = ValidationPipeline::new(Arc::new(engine));
    let config = PipelineConfig::default().with_timeout(Duration::from_millis(100));

    let run = pipeline.execute_pipeline(
        vec![patient("a"), patient("slow"), patient("b")],
        Some(config),
        None,
    );

    assert_eq!(run.results.len(), 3);
    assert!(run.results[0].is_valid);
    assert!(run.results[2].is_valid);
    let slow = &run.results[1];
    assert!(!slow.is_valid);
    assert_eq!(slow.issues[0].code, PIPELINE_TIMEOUT);
    assert_eq!(run.summary.timed_out, 1);
    assert_eq!(run.summary.passed, 2);
    assert!(!run.cancelled);
}

/// Queue double that inspects the ledger while it is being cancelled.
struct ObservingQueue {
    service: OnceLock<CancellationRetryService>,
    seen: Mutex<Option<CancellationStatus>>,
}

impl QueueService for ObservingQueue {
    fn cancel_validation(&self, item_id: &str) -> bool {
        if let Some(service) = self.service.get() {
            *self.seen.lock() = service.active_cancellations().first().map(|r| r.status);
        }
        item_id == "item-7"
    }

    fn cancel_batch(&self, _batch_id: &str) -> usize {
        0
    }
}

#[test]
fn test_cancel_queue_item_lifecycle() {
    let queue = Arc::new(ObservingQueue {
        service: OnceLock::new(),
        seen: Mutex::new(None),
    });
    let service = CancellationRetryService::builder().queue(queue.clone()).build();
    assert!(queue.service.set(service.clone()).is_ok());
    let events = service.subscribe();

    let request = service.cancel_operation(OperationType::QueueItem, "item-7", "duplicate", "alice");

    assert_eq!(*queue.seen.lock(), Some(CancellationStatus::InProgress));
    assert_eq!(request.status, CancellationStatus::Completed);
    assert_eq!(service.get_cancellation(request.id).unwrap().status, CancellationStatus::Completed);

    let received: Vec<_> = events.try_iter().collect();
    assert!(matches!(
        &received[0],
        ControlEvent::CancellationRequested { request_id, .. } if *request_id == request.id
    ));
    assert!(received.iter().any(|e| matches!(
        e,
        ControlEvent::CancellationCompleted { request_id, target_id, .. }
            if *request_id == request.id && target_id == "item-7"
    )));
}

#[test]
fn test_retry_backoff_then_exhausted() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let recorder = attempts.clone();
    let service = CancellationRetryService::builder()
        .retry_handler(OperationType::QueueItem, move |_: OperationType, _: &str, _: u32| {
            recorder.lock().push(Instant::now());
            Err("connection refused".to_string())
        })
        .build();
    let events = service.subscribe();

    let policy = RetryPolicyOverride {
        max_attempts: Some(3),
        base_delay_ms: Some(100),
        exponential: Some(true),
        backoff_multiplier: Some(2.0),
        ..RetryPolicyOverride::default()
    };
    let started = Instant::now();
    let request = service.retry_operation(OperationType::QueueItem, "item-1", "flaky", "ops", Some(&policy));

    assert!(wait_for(|| service.get_retry(request.id).unwrap().status == RetryStatus::Exhausted));
    let done = service.get_retry(request.id).unwrap();
    assert_eq!(done.attempts, 3);
    assert_eq!(done.last_error.as_deref(), Some("connection refused"));

    let times = attempts.lock().clone();
    assert_eq!(times.len(), 3);
    assert!(times[0] - started >= Duration::from_millis(100));
    assert!(times[1] - times[0] >= Duration::from_millis(200));
    assert!(times[2] - times[1] >= Duration::from_millis(400));

    let received: Vec<_> = events.try_iter().collect();
    let delays: Vec<u64> = received
        .iter()
        .filter_map(|e| match e {
            ControlEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![100, 200, 400]);
    assert!(received
        .iter()
        .any(|e| matches!(e, ControlEvent::RetryExhausted { attempts: 3, .. })));
}

#[test]
fn test_cache_hit_skips_validators() {
    let overlap = Arc::new(Overlap::default());
    let engine = engine_with(ValidationSettings::default()).with_validator(Arc::new(Instrumented(overlap.clone())));
    let events = engine.subscribe();

    let first = engine.validate_resource(&patient("p1")).unwrap();
    let second = engine.validate_resource(&patient("p1")).unwrap();

    assert_eq!(overlap.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    let cached: Vec<bool> = events
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::ValidationCompleted { cached, .. } => Some(cached),
            _ => None,
        })
        .collect();
    assert_eq!(cached, vec![false, true]);
}

#[test]
fn test_breaker_opens_and_allows_one_trial() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_millis(100),
    })
    .with_transition_hook(move |_, t| seen.lock().push(t));

    for _ in 0..5 {
        let outcome: Result<(), _> = breakers.call("tx-server", || Err("connection reset"));
        assert!(matches!(outcome, Err(BreakerError::Inner(_))));
    }
    assert_eq!(breakers.state("tx-server"), CircuitState::Open);

    let invoked = AtomicUsize::new(0);
    let rejected = breakers.call("tx-server", || {
        invoked.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(())
    });
    assert!(rejected.as_ref().is_err_and(|e| e.is_open()));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    let err: SystemError = rejected.unwrap_err().into();
    assert!(matches!(err, SystemError::CircuitBreakerOpen { .. }));

    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(breakers.state("tx-server"), CircuitState::HalfOpen);

    let trial = breakers.call("tx-server", || {
        invoked.fetch_add(1, Ordering::SeqCst);
        // A second caller during the trial is turned away
        let concurrent = breakers.call("tx-server", || Ok::<_, String>(()));
        assert!(concurrent.is_err_and(|e| e.is_open()));
        Ok::<_, String>(())
    });
    assert!(trial.is_ok());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breakers.state("tx-server"), CircuitState::Closed);
    assert_eq!(*transitions.lock(), vec![Transition::Opened, Transition::Closed]);
}

proptest! {
    #[test]
    fn prop_score_is_clamped_weighted_penalty(errors in 0usize..20, warnings in 0usize..40, info in 0usize..120) {
        let score = compute_score(errors, warnings, info);
        let expected = 100i64 - 15 * errors as i64 - 5 * warnings as i64 - info as i64;
        prop_assert_eq!(score as i64, expected.max(0));
        prop_assert!(score <= 100);
    }

    #[test]
    fn prop_extra_issue_never_raises_score(errors in 0usize..10, warnings in 0usize..10, info in 0usize..10) {
        let base = compute_score(errors, warnings, info);
        prop_assert!(compute_score(errors + 1, warnings, info) <= base);
        prop_assert!(compute_score(errors, warnings + 1, info) <= base);
        prop_assert!(compute_score(errors, warnings, info + 1) <= base);
    }
}
