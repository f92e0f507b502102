//! Circuit breakers for external services.
//!
//! One breaker per service name. A breaker opens after a run of consecutive
//! failures, rejects calls while open, and after the cooldown lets exactly one
//! trial call through (half-open). A successful trial closes it; a failed
//! trial re-opens it for another cooldown.

use crate::core::error::SystemError;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// State of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A single trial call is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a trial.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Error from a breaker-wrapped call.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    Open { service: String },
    /// The call ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { service } => write!(f, "circuit breaker open for '{}'", service),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BreakerError<E> {}

impl<E> BreakerError<E> {
    /// Whether the call was rejected by an open breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl<E: fmt::Display> From<BreakerError<E>> for SystemError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { service } => SystemError::CircuitBreakerOpen { service },
            BreakerError::Inner(e) => SystemError::Pipeline(e.to_string()),
        }
    }
}

/// Transition reported to the caller of [`CircuitBreakerRegistry::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The breaker just opened.
    Opened,
    /// The breaker just closed after a successful trial.
    Closed,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Service name.
    pub service: String,
    /// Current state.
    pub state: CircuitState,
    /// Current failure streak.
    pub consecutive_failures: u32,
}

type TransitionHook = Box<dyn Fn(&str, Transition) + Send + Sync>;

/// Registry of breakers keyed by external-service name.
pub struct CircuitBreakerRegistry {
    config: Mutex<CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Breaker>>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreakerRegistry {
    /// Create a registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Mutex::new(config),
            breakers: Mutex::new(HashMap::new()),
            on_transition: None,
        }
    }

    /// Register a hook invoked on open/close transitions.
    pub fn with_transition_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, Transition) + Send + Sync + 'static,
    {
        self.on_transition = Some(Box::new(hook));
        self
    }

    /// Update thresholds; existing breaker state is kept.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        *self.config.lock() = config;
    }

    /// Run `op` through the breaker for `service`.
    pub fn call<T, E, F>(&self, service: &str, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit(service)?;
        let outcome = op();
        self.record(service, outcome.is_ok());
        outcome.map_err(BreakerError::Inner)
    }

    /// Current state of a breaker; unknown services are closed.
    pub fn state(&self, service: &str) -> CircuitState {
        let config = *self.config.lock();
        let breakers = self.breakers.lock();
        match breakers.get(service) {
            Some(b) if b.state == CircuitState::Open && cooldown_elapsed(b, &config) => {
                CircuitState::HalfOpen
            }
            Some(b) => b.state,
            None => CircuitState::Closed,
        }
    }

    /// Snapshots of every known breaker, sorted by service.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock();
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(service, b)| BreakerSnapshot {
                service: service.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
            })
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    /// Force a breaker closed.
    pub fn reset(&self, service: &str) {
        self.breakers.lock().remove(service);
    }

    fn admit<E>(&self, service: &str) -> Result<(), BreakerError<E>> {
        let config = *self.config.lock();
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(service.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open if cooldown_elapsed(breaker, &config) => {
                breaker.state = CircuitState::HalfOpen;
                breaker.trial_in_flight = true;
                info!("Circuit breaker for '{}' half-open, allowing trial", service);
                Ok(())
            }
            CircuitState::HalfOpen if !breaker.trial_in_flight => {
                breaker.trial_in_flight = true;
                Ok(())
            }
            CircuitState::Open | CircuitState::HalfOpen => Err(BreakerError::Open {
                service: service.to_string(),
            }),
        }
    }

    fn record(&self, service: &str, success: bool) {
        let threshold = self.config.lock().failure_threshold.max(1);
        let transition = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(service.to_string()).or_insert_with(Breaker::new);
            let was = breaker.state;
            breaker.trial_in_flight = false;

            if success {
                breaker.consecutive_failures = 0;
                breaker.state = CircuitState::Closed;
                breaker.opened_at = None;
                (was != CircuitState::Closed).then_some(Transition::Closed)
            } else {
                breaker.consecutive_failures += 1;
                let open = was == CircuitState::HalfOpen
                    || breaker.consecutive_failures >= threshold;
                if open {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
                (open && was != CircuitState::Open).then_some(Transition::Opened)
            }
        };

        match transition {
            Some(Transition::Opened) => {
                warn!("Circuit breaker for '{}' opened", service);
            }
            Some(Transition::Closed) => {
                info!("Circuit breaker for '{}' closed", service);
            }
            None => {}
        }
        if let (Some(t), Some(hook)) = (transition, &self.on_transition) {
            hook(service, t);
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

fn cooldown_elapsed(breaker: &Breaker, config: &CircuitBreakerConfig) -> bool {
    breaker
        .opened_at
        .map(|t| t.elapsed() >= config.cooldown)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry(cooldown_ms: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    fn fail(registry: &CircuitBreakerRegistry, service: &str) -> Result<(), BreakerError<String>> {
        registry.call(service, || Err::<(), _>("down".to_string()))
    }

    #[test]
    fn test_opens_after_threshold() {
        let registry = registry(10_000);
        for _ in 0..4 {
            assert!(matches!(fail(&registry, "tx"), Err(BreakerError::Inner(_))));
            assert_eq!(registry.state("tx"), CircuitState::Closed);
        }
        assert!(matches!(fail(&registry, "tx"), Err(BreakerError::Inner(_))));
        assert_eq!(registry.state("tx"), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result: Result<(), BreakerError<String>> = registry.call("tx", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_success_resets_streak() {
        let registry = registry(10_000);
        for _ in 0..4 {
            let _ = fail(&registry, "tx");
        }
        let ok: Result<u32, BreakerError<String>> = registry.call("tx", || Ok(1));
        assert_eq!(ok.unwrap(), 1);
        for _ in 0..4 {
            let _ = fail(&registry, "tx");
        }
        assert_eq!(registry.state("tx"), CircuitState::Closed);
    }

    #[test]
    fn test_breakers_are_independent() {
        let registry = registry(10_000);
        for _ in 0..5 {
            let _ = fail(&registry, "a");
        }
        assert_eq!(registry.state("a"), CircuitState::Open);
        assert_eq!(registry.state("b"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_trial_success_closes() {
        let registry = registry(30);
        for _ in 0..5 {
            let _ = fail(&registry, "tx");
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.state("tx"), CircuitState::HalfOpen);

        let ok: Result<(), BreakerError<String>> = registry.call("tx", || Ok(()));
        assert!(ok.is_ok());
        assert_eq!(registry.state("tx"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let registry = registry(30);
        for _ in 0..5 {
            let _ = fail(&registry, "tx");
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(fail(&registry, "tx"), Err(BreakerError::Inner(_))));
        assert_eq!(registry.state("tx"), CircuitState::Open);
        assert!(fail(&registry, "tx").unwrap_err().is_open());
    }

    #[test]
    fn test_only_one_trial_while_half_open() {
        let registry = Arc::new(registry(20));
        for _ in 0..5 {
            let _ = fail(&registry, "tx");
        }
        std::thread::sleep(Duration::from_millis(40));

        let (entered_tx, entered_rx) = crossbeam::channel::bounded(1);
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
        let trial_registry = Arc::clone(&registry);
        let trial = std::thread::spawn(move || {
            trial_registry.call("tx", || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok::<_, String>(())
            })
        });

        entered_rx.recv().unwrap();
        let second: Result<(), BreakerError<String>> = registry.call("tx", || Ok(()));
        assert!(second.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert!(trial.join().unwrap().is_ok());
        assert_eq!(registry.state("tx"), CircuitState::Closed);
    }

    #[test]
    fn test_transition_hook() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(10),
        })
        .with_transition_hook(move |service, t| sink.lock().push((service.to_string(), t)));

        let _ = fail(&registry, "x");
        let _ = fail(&registry, "x");
        std::thread::sleep(Duration::from_millis(20));
        let _: Result<(), BreakerError<String>> = registry.call("x", || Ok(()));

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("x".to_string(), Transition::Opened),
                ("x".to_string(), Transition::Closed)
            ]
        );
    }
}
