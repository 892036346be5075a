use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use single_object_cache::{
    CacheError, CancellationCheck, CompletionHandle, RefreshDriver, SingleObjectCache,
};

use crate::utils::{ManualDriver, resolved, setup};

fn manual_cache() -> SingleObjectCache<ManualDriver> {
    SingleObjectCache::new(ManualDriver::default())
}

#[test]
fn test_no_pending_refresh_if_already_cancelled() {
    setup();
    let cache = manual_cache();

    let mut completion = cache.request("foo".into(), || true);

    cache.driver().assert_no_pending_refreshes();
    assert!(resolved(&mut completion).unwrap_err().is_cancelled());
    assert!(cache.get_no_refresh().is_none());
}

#[test]
fn test_listeners_completed_by_refresh() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    // The first request starts a refresh
    let mut completion0 = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(1);

    // The second request with a matching key does not refresh again
    let mut completion1 = cache.request("foo".into(), || false);
    assert!(completion0.try_result().is_none());
    assert!(completion1.try_result().is_none());
    driver.assert_pending_refreshes(1);

    driver.complete_next_refresh("foo", 1);
    let value0 = resolved(&mut completion0).unwrap();
    let value1 = resolved(&mut completion1).unwrap();
    assert_eq!(*value0, 1);
    assert!(Arc::ptr_eq(&value0, &value1));

    // A further request with a matching key re-uses the cached value
    let mut completion2 = cache.request("foo".into(), || false);
    driver.assert_no_pending_refreshes();
    let value2 = resolved(&mut completion2).unwrap();
    assert!(Arc::ptr_eq(&value1, &value2));

    // A request with a different key triggers another refresh
    let mut completion3 = cache.request("bar".into(), || false);
    assert!(completion3.try_result().is_none());
    driver.assert_pending_refreshes(1);
    driver.complete_next_refresh("bar", 2);
    assert_eq!(*resolved(&mut completion3).unwrap(), 2);
    assert_eq!(cache.get_no_refresh().as_deref(), Some(&2));
}

#[test]
fn test_listener_completed_by_refresh_even_if_discarded() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    // The caller loses interest after its request was registered
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut completion1 = cache.request("foo".into(), {
        let cancelled = Arc::clone(&cancelled);
        move || cancelled.load(Ordering::Relaxed)
    });
    cancelled.store(true, Ordering::Relaxed);
    driver.assert_pending_refreshes(1);
    assert!(completion1.try_result().is_none());

    // However the refresh continues and makes its result available to a later request
    let mut completion2 = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(1);
    driver.complete_next_refresh("foo", 1);
    let value2 = resolved(&mut completion2).unwrap();
    assert_eq!(*value2, 1);

    // ... and the original listener is also completed successfully
    let value1 = resolved(&mut completion1).unwrap();
    assert!(Arc::ptr_eq(&value1, &value2));
}

#[test]
fn test_listener_completed_with_cancellation_if_refresh_cancelled() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    let cancelled = Arc::new(AtomicBool::new(false));
    let mut completion1 = cache.request("foo".into(), {
        let cancelled = Arc::clone(&cancelled);
        move || cancelled.load(Ordering::Relaxed)
    });
    cancelled.store(true, Ordering::Relaxed);
    driver.assert_pending_refreshes(1);
    assert!(completion1.try_result().is_none());

    // A request with a non-matching key cancels the original refresh and starts another one
    let mut completion2 = cache.request("bar".into(), || false);
    driver.assert_pending_refreshes(2);
    driver.assert_next_refresh_cancelled();
    assert!(resolved(&mut completion1).unwrap_err().is_cancelled());

    driver.complete_next_refresh("bar", 2);
    assert_eq!(*resolved(&mut completion2).unwrap(), 2);
}

#[test]
fn test_error_completes_listeners_but_is_not_cached() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    // If a refresh fails then all the pending requests complete with that failure
    let mut completion0 = cache.request("foo".into(), || false);
    let mut completion1 = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(1);
    driver.fail_next_refresh(anyhow::anyhow!("simulated"));

    let err0 = resolved(&mut completion0).unwrap_err();
    let err1 = resolved(&mut completion1).unwrap_err();
    match (err0, err1) {
        (CacheError::Failed(err0), CacheError::Failed(err1)) => {
            assert!(Arc::ptr_eq(&err0, &err1));
            assert_eq!(err0.to_string(), "simulated");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    driver.assert_no_pending_refreshes();
    assert!(cache.get_no_refresh().is_none());

    // The failure is not cached, so a subsequent request with a matching key refreshes again
    let mut completion2 = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(1);
    driver.complete_next_refresh("foo", 1);
    assert_eq!(*resolved(&mut completion2).unwrap(), 1);
}

#[test]
fn test_failure_keeps_previous_value() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    let mut completion = cache.request("foo".into(), || false);
    driver.complete_next_refresh("foo", 1);
    resolved(&mut completion).unwrap();

    let mut completion = cache.request("bar".into(), || false);
    driver.fail_next_refresh(anyhow::anyhow!("simulated"));
    assert!(resolved(&mut completion).is_err());

    // the failed refresh for `bar` did not replace the value committed for `foo`
    assert_eq!(cache.get_no_refresh().as_deref(), Some(&1));
    let mut completion = cache.request("foo".into(), || false);
    driver.assert_no_pending_refreshes();
    assert_eq!(*resolved(&mut completion).unwrap(), 1);
}

#[test]
fn test_superseded_value_is_not_committed() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    let mut foo = cache.request("foo".into(), || false);
    let mut bar = cache.request("bar".into(), || false);
    driver.assert_pending_refreshes(2);

    // The superseded refresh ignores its cancellation and produces a value anyway
    let refresh = driver.next_refresh();
    assert!(refresh.check.is_cancelled());
    refresh.on_result.succeed(1);

    // Its own listener still gets that value, but the cache does not keep it
    assert_eq!(*resolved(&mut foo).unwrap(), 1);
    assert!(cache.get_no_refresh().is_none());
    assert!(bar.try_result().is_none());

    driver.complete_next_refresh("bar", 2);
    assert_eq!(*resolved(&mut bar).unwrap(), 2);
    assert_eq!(cache.get_no_refresh().as_deref(), Some(&2));
}

#[test]
fn test_churn_back_to_same_key_does_not_resurrect_stale_value() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    // foo -> baz -> foo: the first foo refresh is superseded, even though the key matches again
    let mut first_foo = cache.request("foo".into(), || false);
    let mut baz = cache.request("baz".into(), || false);
    let mut second_foo = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(3);

    let stale = driver.next_refresh();
    assert!(stale.check.is_cancelled());
    stale.on_result.succeed(10);
    assert_eq!(*resolved(&mut first_foo).unwrap(), 10);
    assert!(cache.get_no_refresh().is_none());

    // later requests join the current refresh, rather than being served the stale value
    let mut third_foo = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(2);

    driver.assert_next_refresh_cancelled();
    assert!(resolved(&mut baz).unwrap_err().is_cancelled());

    driver.complete_next_refresh("foo", 11);
    let second = resolved(&mut second_foo).unwrap();
    let third = resolved(&mut third_foo).unwrap();
    assert_eq!(*second, 11);
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(cache.get_no_refresh().as_deref(), Some(&11));
}

#[test]
fn test_abandoned_refresh_resolves_listeners() {
    setup();
    let cache = manual_cache();
    let driver = cache.driver();

    let mut completion0 = cache.request("foo".into(), || false);
    let mut completion1 = cache.request("foo".into(), || false);
    drop(driver.next_refresh());

    assert!(matches!(
        resolved(&mut completion0),
        Err(CacheError::Abandoned)
    ));
    assert!(matches!(
        resolved(&mut completion1),
        Err(CacheError::Abandoned)
    ));

    // the abandoned refresh is gone, a new request starts over
    let mut completion2 = cache.request("foo".into(), || false);
    driver.assert_pending_refreshes(1);
    driver.complete_next_refresh("foo", 3);
    assert_eq!(*resolved(&mut completion2).unwrap(), 3);
}

#[test]
fn test_listener_can_reenter_cache() {
    setup();
    let cache = manual_cache();

    let hits = Arc::new(AtomicUsize::new(0));
    let listener = CompletionHandle::new({
        let cache = cache.clone();
        let hits = Arc::clone(&hits);
        move |result: Result<Arc<usize>, CacheError>| {
            assert_eq!(*result.unwrap(), 5);
            // served from the freshly committed value, while notifications are still going on
            let hits = Arc::clone(&hits);
            cache.get(
                "foo".into(),
                || false,
                CompletionHandle::new(move |result: Result<Arc<usize>, CacheError>| {
                    assert_eq!(*result.unwrap(), 5);
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
    });
    cache.get("foo".into(), || false, listener);

    cache.driver().complete_next_refresh("foo", 5);

    assert_eq!(hits.load(Ordering::Relaxed), 1);
    cache.driver().assert_no_pending_refreshes();
}

/// A driver which computes versioned values synchronously, and accepts newer versions as fresh.
#[derive(Default)]
struct VersionDriver {
    refreshes: AtomicUsize,
}

impl RefreshDriver for VersionDriver {
    type Input = u64;
    type Key = u64;
    type Value = String;

    fn key_of(&self, input: &Self::Input) -> Self::Key {
        *input
    }

    fn refresh(
        &self,
        input: Self::Input,
        _check: CancellationCheck,
        on_result: CompletionHandle<Self::Value>,
    ) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        on_result.succeed(format!("state v{input}"));
    }

    fn is_fresh(&self, current: &Self::Key, requested: &Self::Key) -> bool {
        current >= requested
    }
}

#[test]
fn test_refresh_completed_synchronously() {
    setup();
    let cache = SingleObjectCache::new(VersionDriver::default());

    let mut completion = cache.request(3, || false);
    assert_eq!(*resolved(&mut completion).unwrap(), "state v3");

    // an older version is satisfied by the newer value
    let mut completion = cache.request(2, || false);
    assert_eq!(*resolved(&mut completion).unwrap(), "state v3");
    assert_eq!(cache.driver().refreshes.load(Ordering::Relaxed), 1);

    let mut completion = cache.request(4, || false);
    assert_eq!(*resolved(&mut completion).unwrap(), "state v4");
    assert_eq!(cache.driver().refreshes.load(Ordering::Relaxed), 2);
}

#[test]
fn test_is_fresh_applies_to_pending_refresh() {
    setup();

    #[derive(Default)]
    struct Driver {
        inner: ManualDriver,
    }

    impl RefreshDriver for Driver {
        type Input = String;
        type Key = String;
        type Value = usize;

        fn key_of(&self, input: &Self::Input) -> Self::Key {
            input.clone()
        }

        fn refresh(
            &self,
            input: Self::Input,
            check: CancellationCheck,
            on_result: CompletionHandle<Self::Value>,
        ) {
            self.inner.refresh(input, check, on_result)
        }

        // any key is as good as any other
        fn is_fresh(&self, _current: &Self::Key, _requested: &Self::Key) -> bool {
            true
        }
    }

    let cache = SingleObjectCache::new(Driver::default());
    let mut foo = cache.request("foo".into(), || false);
    let mut bar = cache.request("bar".into(), || false);

    cache.driver().inner.assert_pending_refreshes(1);
    cache.driver().inner.complete_next_refresh("foo", 1);

    let foo = resolved(&mut foo).unwrap();
    let bar = resolved(&mut bar).unwrap();
    assert!(Arc::ptr_eq(&foo, &bar));
}

#[test]
fn test_debug_output() {
    #[derive(Debug)]
    struct Named;

    impl RefreshDriver for Named {
        type Input = ();
        type Key = ();
        type Value = ();

        const NAME: &'static str = "named";

        fn key_of(&self, _input: &Self::Input) -> Self::Key {}

        fn refresh(
            &self,
            _input: Self::Input,
            _check: CancellationCheck,
            on_result: CompletionHandle<Self::Value>,
        ) {
            on_result.succeed(())
        }
    }

    let cache = SingleObjectCache::new(Named);
    assert_eq!(
        format!("{cache:?}"),
        r#"SingleObjectCache { name: "named", driver: Named, cached_key: None, pending: None }"#
    );

    let _completion = cache.request((), || false);
    assert_eq!(
        format!("{cache:?}"),
        r#"SingleObjectCache { name: "named", driver: Named, cached_key: Some(()), pending: None }"#
    );
}
