use std::fmt;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::{CacheError, CancellationCheck, CompletionHandle};

/// The Refresh Driver
///
/// The driver is responsible for providing the actual computation whose result is cached, as
/// well as determining the key that identifies which logical value a request asks for.
pub trait RefreshDriver: Send + Sync + 'static {
    /// Input argument of a request.
    type Input: Send + 'static;
    /// Identity of the value an input asks for.
    type Key: Clone + Eq + fmt::Debug + Send + Sync + 'static;
    /// The resulting output of the computation.
    type Value: Send + Sync + 'static;

    /// Name of the cache, used to tag logs and metrics.
    const NAME: &'static str = "default";

    /// Returns the key corresponding to the `input`.
    fn key_of(&self, input: &Self::Input) -> Self::Key;

    /// Starts computing a new value for `input`, resolving `on_result` once done.
    ///
    /// This must not block. It may resolve `on_result` right away, or later from any thread.
    /// Long-running computations should call
    /// [`ensure_not_cancelled`](CancellationCheck::ensure_not_cancelled) on `check` every now and
    /// then, and give up once they have been superseded.
    fn refresh(
        &self,
        input: Self::Input,
        check: CancellationCheck,
        on_result: CompletionHandle<Self::Value>,
    );

    /// Tells whether a value held for `current` is good enough for a request of `requested`.
    ///
    /// Applies both to the committed value and to a computation in progress.
    fn is_fresh(&self, current: &Self::Key, requested: &Self::Key) -> bool {
        current == requested
    }
}

/// The Cache Computation Driver
///
/// An async flavor of [`RefreshDriver`], where the computation is a [`Future`](std::future::Future)
/// rather than a callback. Wrap it in [`Spawned`] to use it with a
/// [`SingleObjectCache`](crate::SingleObjectCache).
pub trait ComputationDriver: Send + Sync + 'static {
    /// Input argument of a request.
    type Input: Send + 'static;
    /// Identity of the value an input asks for.
    type Key: Clone + Eq + fmt::Debug + Send + Sync + 'static;
    /// The resulting output of the computation.
    type Value: Send + Sync + 'static;

    /// Name of the cache, used to tag logs and metrics.
    const NAME: &'static str = "default";

    /// Returns the key corresponding to the `input`.
    fn key_of(&self, input: &Self::Input) -> Self::Key;

    /// Computes a new value for `input`.
    fn compute(
        &self,
        input: Self::Input,
        check: CancellationCheck,
    ) -> BoxFuture<'static, Result<Self::Value, CacheError>>;

    /// See [`RefreshDriver::is_fresh`].
    fn is_fresh(&self, current: &Self::Key, requested: &Self::Key) -> bool {
        current == requested
    }
}

/// Runs the computations of a [`ComputationDriver`] as tasks on a tokio runtime.
pub struct Spawned<D> {
    driver: D,
    runtime: Handle,
}

impl<D> Spawned<D> {
    /// Spawns computations of `driver` onto `runtime`.
    pub fn new(driver: D, runtime: Handle) -> Self {
        Self { driver, runtime }
    }

    /// Spawns computations of `driver` onto the runtime of the current context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current(driver: D) -> Self {
        Self::new(driver, Handle::current())
    }

    /// Gives access to the wrapped driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: fmt::Debug> fmt::Debug for Spawned<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawned")
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl<D: ComputationDriver> RefreshDriver for Spawned<D> {
    type Input = D::Input;
    type Key = D::Key;
    type Value = D::Value;

    const NAME: &'static str = D::NAME;

    fn key_of(&self, input: &Self::Input) -> Self::Key {
        self.driver.key_of(input)
    }

    fn refresh(
        &self,
        input: Self::Input,
        check: CancellationCheck,
        on_result: CompletionHandle<Self::Value>,
    ) {
        let computation = self.driver.compute(input, check);
        // If the runtime shuts down before the task finishes, `on_result` is dropped and resolves
        // as abandoned.
        self.runtime.spawn(async move {
            on_result.complete(computation.await);
        });
    }

    fn is_fresh(&self, current: &Self::Key, requested: &Self::Key) -> bool {
        self.driver.is_fresh(current, requested)
    }
}
