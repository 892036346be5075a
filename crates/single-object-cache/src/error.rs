use std::sync::Arc;

use thiserror::Error;

/// The failure delivered to a caller instead of a value.
///
/// This error is cheap to clone. All listeners joined to the same computation receive clones of
/// the same error, so a [`Failed`](Self::Failed) error points to one shared [`anyhow::Error`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The request was cancelled.
    ///
    /// This happens when the caller was already cancelled at the time of the request, or when the
    /// computation it joined was superseded by a request for a different key and noticed so through
    /// its [`CancellationCheck`](crate::CancellationCheck).
    #[error("refresh cancelled")]
    Cancelled,
    /// The computation dropped its result handle without ever resolving it.
    #[error("refresh abandoned without a result")]
    Abandoned,
    /// The computation failed.
    ///
    /// The attached error is whatever the computation reported, shared between all listeners.
    #[error("refresh failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl CacheError {
    /// Wraps an arbitrary computation error.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::from(err.into())
    }

    /// Returns `true` if this is a [`Cancelled`](Self::Cancelled) error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for CacheError {
    /// Converts a computation error.
    ///
    /// A [`CacheError`] that was propagated through `anyhow` (for example by using `?` on
    /// [`ensure_not_cancelled`](crate::CancellationCheck::ensure_not_cancelled)) is unwrapped
    /// again instead of being reported as a [`Failed`](Self::Failed) computation.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CacheError>() {
            Ok(err) => err,
            Err(err) => Self::Failed(Arc::new(err)),
        }
    }
}
