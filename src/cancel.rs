//! Cooperative stop flag shared between the signal thread and the pipeline.

use crate::error::{SquashError, SquashResult};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Raised once a termination signal arrives. Long-running steps poll it
/// between layers and archive entries and stop with
/// [`SquashError::Interrupted`], so nothing writes into the working
/// directory while it is being removed.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicI32>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `signal` as the reason to stop. The first signal wins.
    pub fn cancel(&self, signal: i32) {
        let _ = self
            .0
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn signal(&self) -> Option<i32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal().is_some()
    }

    /// Fails with [`SquashError::Interrupted`] once cancelled.
    pub fn check(&self) -> SquashResult<()> {
        match self.signal() {
            Some(signal) => Err(SquashError::Interrupted(signal)),
            None => Ok(()),
        }
    }
}
