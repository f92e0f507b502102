//! Shared cooperative stop flag.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A stop flag read by long-running loops at their checkpoints.
///
/// Clones share the same flag. Raising it never interrupts work in progress.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl StopSignal {
    /// Create a lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Raise the signal and record why.
    pub fn raise_with(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
        self.raise();
    }

    /// Whether the signal is raised.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lower the signal and forget the reason.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
        *self.reason.lock() = None;
    }

    /// Reason given when the signal was raised.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
