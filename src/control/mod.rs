//! Operator lifecycle control over validation work.
//!
//! Cancellation is cooperative: commands stop new work and raise flags, but
//! never interrupt an aspect evaluation that already started.

pub mod service;
pub mod stop;
pub mod types;

pub use service::{CancellationRetryService, CancellationRetryServiceBuilder, CleanupTask, RetryHandler};
pub use stop::StopSignal;
pub use types::{
    CancellationRequest, CancellationStatus, ControlEvent, ControlStats, OperationType, RetryRequest, RetryStatus,
};
