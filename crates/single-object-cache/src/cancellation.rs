use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::CacheError;

/// Cooperative cancellation check handed to every computation.
///
/// The cache never interrupts a running computation. Instead, a computation that was superseded
/// by a request for a different key gets flagged, and it is up to the computation to call
/// [`ensure_not_cancelled`](Self::ensure_not_cancelled) at whatever checkpoints it sees fit.
#[derive(Clone, Default)]
pub struct CancellationCheck {
    cancelled: Arc<AtomicBool>,
}

impl CancellationCheck {
    pub(crate) fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    /// Returns `true` if the computation has been superseded.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails with [`CacheError::Cancelled`] if the computation has been superseded.
    pub fn ensure_not_cancelled(&self) -> Result<(), CacheError> {
        if self.is_cancelled() {
            Err(CacheError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for CancellationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationCheck")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
