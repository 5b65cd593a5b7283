//! Explicit cancellation handles for cooperative cancellation
//!
//! Every awaited load operation receives a handle; cancellation is a
//! request, not a guarantee. Staleness of late completions is decided
//! separately by generation tokens, never by handle identity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable cancellation handle shared between a requester and the task
/// doing the work. Cancelling is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a fresh, un-cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Error shortcut for cooperative checkpoints inside async work.
    pub fn check(&self) -> crate::core::types::Result<()> {
        if self.is_cancelled() {
            Err(crate::core::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
