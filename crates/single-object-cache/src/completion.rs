use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::CacheError;

type Callback<T> = Box<dyn FnOnce(Result<T, CacheError>) + Send + 'static>;

/// A one-shot sink for the outcome of a request or a computation.
///
/// Resolving a handle consumes it, so a handle can be resolved at most once, with either a value
/// or an error. A handle that is dropped without being resolved resolves itself with
/// [`CacheError::Abandoned`], so whoever waits on it always hears back exactly once.
///
/// Handles can be resolved from any thread.
pub struct CompletionHandle<T> {
    callback: Option<Callback<T>>,
}

impl<T> CompletionHandle<T> {
    /// Creates a handle that invokes `f` with the outcome.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<T, CacheError>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    /// Creates a handle together with a [`Completion`] future resolving to its outcome.
    pub fn channel() -> (Self, Completion<T>)
    where
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let handle = Self::new(move |result| {
            // the receiving side is allowed to lose interest
            sender.send(result).ok();
        });

        (handle, Completion { receiver })
    }

    /// Resolves the handle with a value.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value))
    }

    /// Resolves the handle with an error.
    pub fn fail(self, err: impl Into<CacheError>) {
        self.complete(Err(err.into()))
    }

    /// Resolves the handle with the given outcome.
    pub fn complete(mut self, result: Result<T, CacheError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for CompletionHandle<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            tracing::debug!("Completion handle dropped without a result");
            callback(Err(CacheError::Abandoned));
        }
    }
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("resolved", &self.callback.is_none())
            .finish()
    }
}

/// The receiving end of [`CompletionHandle::channel`].
///
/// Resolves once the corresponding handle has been resolved or dropped.
#[derive(Debug)]
#[must_use = "a completion does nothing unless polled or awaited"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T, CacheError>>,
}

impl<T> Completion<T> {
    /// Takes the outcome if it is already available, without waiting.
    ///
    /// Returns `None` while the handle is still unresolved. Once an outcome has been returned, the
    /// completion is spent and further calls report [`CacheError::Abandoned`].
    pub fn try_result(&mut self) -> Option<Result<T, CacheError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CacheError::Abandoned)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CacheError::Abandoned)))
    }
}
