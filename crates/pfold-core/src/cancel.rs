use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FoldError, Result};

/// Cooperative stop flag shared between the signal handler and the
/// reader/consumer loops. Loops poll it only at block boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(FoldError::Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FoldError::Cancelled)
        } else {
            Ok(())
        }
    }
}
