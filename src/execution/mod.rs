//! Execution module.
//!
//! This module runs validations: the engine itself plus the caching,
//! circuit breaking, retry and progress machinery it and the pipeline share.

pub mod cache;
pub mod circuit;
pub mod engine;
pub mod progress;
pub mod retry;

pub use cache::{CacheKey, CacheStats, EngineCaches, ResultCache, TtlCache};
pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use engine::{EngineEvent, EngineStats, ValidationEngine};
pub use progress::{ProgressTracker, ProgressUpdate};
pub use retry::{retry_with_backoff, RetryPolicy};
