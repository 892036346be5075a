use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::{CacheError, CancellationCheck, Completion, CompletionHandle, RefreshDriver, metric};

type Listener<V> = CompletionHandle<Arc<V>>;

/// The most recently committed value, along with the key it was computed for.
struct CachedEntry<K, V> {
    key: K,
    value: Arc<V>,
}

/// Bookkeeping for one in-flight computation.
struct PendingComputation<K, V> {
    key: K,
    /// Identifies this computation, used to tell whether it is still the current one.
    generation: u64,
    /// Set once a request for a different key superseded this computation.
    cancelled: Arc<AtomicBool>,
    /// Requests waiting for this computation.
    ///
    /// Only ever locked while holding the lock on the [`CacheState`].
    listeners: Mutex<Vec<Listener<V>>>,
}

impl<K, V> PendingComputation<K, V> {
    fn new(key: K, generation: u64, listener: Listener<V>) -> Self {
        Self {
            key,
            generation,
            cancelled: Default::default(),
            listeners: Mutex::new(vec![listener]),
        }
    }

    fn cancellation_check(&self) -> CancellationCheck {
        CancellationCheck::new(Arc::clone(&self.cancelled))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// The mutable slot of the cache.
struct CacheState<K, V> {
    cached: Option<CachedEntry<K, V>>,
    pending: Option<Arc<PendingComputation<K, V>>>,
    /// The generation of the most recently started computation.
    generation: u64,
}

impl<K, V> Default for CacheState<K, V> {
    fn default() -> Self {
        Self {
            cached: None,
            pending: None,
            generation: 0,
        }
    }
}

/// How a request was classified against the current [`CacheState`].
enum Request<K, V> {
    /// The committed value satisfies the request.
    Hit(Listener<V>, Arc<V>),
    /// The request joined the computation already in progress.
    Coalesced,
    /// The request started a new computation.
    Started(Arc<PendingComputation<K, V>>),
}

struct Inner<D: RefreshDriver> {
    driver: D,
    state: Mutex<CacheState<D::Key, D::Value>>,
}

/// A cache for a single value that is expensive to compute, and whose identity changes over time.
///
/// The purpose of this cache is to do request coalescing: all concurrent requests for the same
/// key share one computation, and a committed value is reused for as long as requests keep asking
/// for its key. A request for a different key supersedes whatever was cached or being computed.
///
/// The cache is constructed with a [`RefreshDriver`] that provides keys and a way to compute new
/// values on demand. Superseded computations are never interrupted; they are only flagged through
/// their [`CancellationCheck`], still resolve all the requests that joined them, but never
/// replace the committed value.
///
/// Failures are never cached. Every request is resolved exactly once, with either the value, a
/// [`CacheError::Cancelled`], or the failure of the computation it joined.
pub struct SingleObjectCache<D: RefreshDriver> {
    inner: Arc<Inner<D>>,
}

impl<D: RefreshDriver> Clone for SingleObjectCache<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: RefreshDriver + fmt::Debug> fmt::Debug for SingleObjectCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cached_key, pending) = match self.inner.state.try_lock() {
            Some(state) => (
                state.cached.as_ref().map(|cached| cached.key.clone()),
                state
                    .pending
                    .as_ref()
                    .map(|pending| (pending.key.clone(), pending.generation)),
            ),
            None => (None, None),
        };
        f.debug_struct("SingleObjectCache")
            .field("name", &D::NAME)
            .field("driver", &self.inner.driver)
            .field("cached_key", &cached_key)
            .field("pending", &pending)
            .finish()
    }
}

impl<D: RefreshDriver> SingleObjectCache<D> {
    /// Creates a new, empty cache.
    pub fn new(driver: D) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                state: Default::default(),
            }),
        }
    }

    /// Gives access to the driver.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Returns the committed value, without computing anything.
    pub fn get_no_refresh(&self) -> Option<Arc<D::Value>> {
        let state = self.inner.state.lock();
        state.cached.as_ref().map(|cached| Arc::clone(&cached.value))
    }

    /// Requests the value for `input`, resolving `listener` once it is available.
    ///
    /// `is_cancelled` is checked exactly once, before anything else. If the request is already
    /// cancelled, `listener` fails right away with [`CacheError::Cancelled`]. Cancelling the
    /// request afterwards has no effect on it.
    ///
    /// Otherwise, the request is resolved right away with the committed value if its key is
    /// fresh, joins the computation in progress for a fresh key, or supersedes both by starting
    /// a new computation. This never blocks; `listener` may be resolved later from any thread.
    pub fn get<F>(&self, input: D::Input, is_cancelled: F, listener: Listener<D::Value>)
    where
        F: FnOnce() -> bool,
    {
        if is_cancelled() {
            tracing::trace!(cache = D::NAME, "Request cancelled before registering");
            record_request::<D>("cancelled");
            listener.fail(CacheError::Cancelled);
            return;
        }

        let key = self.inner.driver.key_of(&input);
        match self.classify(key, listener) {
            Request::Hit(listener, value) => {
                record_request::<D>("hit");
                listener.succeed(value);
            }
            Request::Coalesced => {
                record_request::<D>("coalesced");
            }
            Request::Started(pending) => {
                record_request::<D>("started");
                self.start_refresh(input, pending);
            }
        }
    }

    /// Requests the value for `input`, returning a [`Completion`] to await it.
    ///
    /// See [`get`](Self::get) for the semantics.
    pub fn request<F>(&self, input: D::Input, is_cancelled: F) -> Completion<Arc<D::Value>>
    where
        F: FnOnce() -> bool,
    {
        let (listener, completion) = CompletionHandle::channel();
        self.get(input, is_cancelled, listener);
        completion
    }

    /// Decides how to serve a request for `key`, registering `listener` unless it is a hit.
    fn classify(&self, key: D::Key, listener: Listener<D::Value>) -> Request<D::Key, D::Value> {
        let driver = &self.inner.driver;
        let mut state = self.inner.state.lock();

        if let Some(cached) = &state.cached {
            if driver.is_fresh(&cached.key, &key) {
                tracing::trace!(cache = D::NAME, ?key, "Serving committed value");
                return Request::Hit(listener, Arc::clone(&cached.value));
            }
        }

        if let Some(pending) = &state.pending {
            if driver.is_fresh(&pending.key, &key) {
                tracing::trace!(
                    cache = D::NAME,
                    ?key,
                    generation = pending.generation,
                    "Joining pending refresh"
                );
                pending.listeners.lock().push(listener);
                return Request::Coalesced;
            }
        }

        if let Some(superseded) = state.pending.take() {
            tracing::debug!(
                cache = D::NAME,
                key = ?superseded.key,
                generation = superseded.generation,
                "Superseding pending refresh"
            );
            metric!(counter("single_object_cache.superseded") += 1, "cache" => D::NAME);
            superseded.cancel();
        }

        state.generation += 1;
        let pending = Arc::new(PendingComputation::new(key, state.generation, listener));
        state.pending = Some(Arc::clone(&pending));

        Request::Started(pending)
    }

    /// Hands `pending` to the driver, with a result handle that finishes it.
    fn start_refresh(
        &self,
        input: D::Input,
        pending: Arc<PendingComputation<D::Key, D::Value>>,
    ) {
        tracing::debug!(
            cache = D::NAME,
            key = ?pending.key,
            generation = pending.generation,
            "Starting refresh"
        );

        let check = pending.cancellation_check();
        let inner = Arc::clone(&self.inner);
        let start = Instant::now();
        let on_result = CompletionHandle::new(move |result| {
            metric!(
                timer("single_object_cache.refresh.duration") = start.elapsed(),
                "cache" => D::NAME,
            );
            inner.finish_refresh(&pending, result);
        });

        self.inner.driver.refresh(input, check, on_result);
    }
}

fn record_request<D: RefreshDriver>(outcome: &'static str) {
    metric!(
        counter("single_object_cache.get") += 1,
        "cache" => D::NAME,
        "outcome" => outcome,
    );
}

impl<D: RefreshDriver> Inner<D> {
    /// Commits the outcome of `pending` if it is still current, and resolves its listeners.
    fn finish_refresh(
        &self,
        pending: &PendingComputation<D::Key, D::Value>,
        result: Result<D::Value, CacheError>,
    ) {
        let result = result.map(Arc::new);

        let (is_current, listeners) = {
            let mut state = self.state.lock();
            let is_current = state.generation == pending.generation;
            if is_current {
                state.pending = None;
                if let Ok(value) = &result {
                    state.cached = Some(CachedEntry {
                        key: pending.key.clone(),
                        value: Arc::clone(value),
                    });
                }
            }
            // Nothing can join `pending` anymore: it is either superseded or was just removed.
            let listeners = mem::take(&mut *pending.listeners.lock());
            (is_current, listeners)
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(CacheError::Cancelled) => "cancelled",
            Err(CacheError::Abandoned) => "abandoned",
            Err(CacheError::Failed(_)) => "failed",
        };
        let committed = is_current && result.is_ok();
        tracing::debug!(
            cache = D::NAME,
            key = ?pending.key,
            generation = pending.generation,
            outcome,
            committed,
            listeners = listeners.len(),
            "Refresh finished"
        );
        metric!(
            counter("single_object_cache.refresh.completed") += 1,
            "cache" => D::NAME,
            "outcome" => outcome,
            "committed" => if committed { "true" } else { "false" },
        );

        for listener in listeners {
            listener.complete(result.clone());
        }
    }
}
