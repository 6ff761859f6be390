//! Bounded cache integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_test::assert_ok;

use elohim_stash::{
    BoundedCache, BoundedCacheConfig, CacheListener, ChangeToken, EvictionNotification,
    EvictionReason, Expiration, ExpirationPolicy, SharedCache,
};

type Seen = Arc<Mutex<Vec<(String, EvictionReason)>>>;

#[derive(Default)]
struct Recorder {
    evicted: Seen,
    limited: Mutex<Vec<(usize, usize)>>,
}

impl CacheListener<String, i32> for Recorder {
    fn on_limited(&self, overflow_by: usize, count: usize) {
        self.limited.lock().unwrap().push((overflow_by, count));
    }

    fn on_evicted(&self, notification: &EvictionNotification<String, i32>) {
        self.evicted
            .lock()
            .unwrap()
            .push((notification.key.clone(), notification.reason));
    }
}

fn cache(count_limit: usize) -> BoundedCache<String, i32> {
    BoundedCache::new(BoundedCacheConfig {
        count_limit,
        ..Default::default()
    })
}

/// SetValue("k", 1, sliding=100ms); with no access at all, the background
/// purge evicts the entry with reason Expired.
#[tokio::test]
async fn test_sliding_expiration_evicts_idle_entry() {
    let cache = cache(0);
    let fired: Seen = Seen::default();
    let callback_fired = Arc::clone(&fired);

    let policy = ExpirationPolicy::sliding(Duration::from_millis(100)).on_evicted(
        move |n: &EvictionNotification<String, i32>| {
            callback_fired.lock().unwrap().push((n.key.clone(), n.reason));
        },
    );
    assert_ok!(cache.set_value("k".to_string(), 1, policy));

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        *fired.lock().unwrap(),
        vec![("k".to_string(), EvictionReason::Expired)]
    );
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.stats().evicted_expired, 1);
    assert_eq!(cache.get(&"k".to_string()), None);
}

/// Accessing an entry inside its sliding window keeps it alive.
#[tokio::test]
async fn test_sliding_window_refreshes_on_access() {
    let cache = cache(0);
    assert_ok!(cache.set_value(
        "k".to_string(),
        1,
        ExpirationPolicy::sliding(Duration::from_millis(150)),
    ));

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&"k".to_string()), Some(1));
    }
}

/// The absolute deadline wins even while sliding access keeps the entry warm.
#[tokio::test]
async fn test_absolute_deadline_caps_sliding() {
    let cache = cache(0);
    let policy = ExpirationPolicy::new(
        Expiration::absolute_in(Duration::from_millis(120)).with_sliding(Duration::from_secs(10)),
    );
    assert_ok!(cache.set_value("k".to_string(), 1, policy));

    assert_eq!(cache.get(&"k".to_string()), Some(1));
    tokio::time::sleep(Duration::from_millis(180)).await;
    assert_eq!(cache.get(&"k".to_string()), None);
}

/// Exceeding the soft limit notifies listeners but evicts nothing.
#[test]
fn test_count_limit_is_soft() {
    let cache = cache(2);
    let recorder = Arc::new(Recorder::default());
    assert_ok!(cache.subscribe(recorder.clone()));

    for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
        assert_ok!(cache.set_value(key.to_string(), i as i32, ExpirationPolicy::never()));
    }

    assert_eq!(cache.len(), 3);
    assert_eq!(*recorder.limited.lock().unwrap(), vec![(1, 3)]);
    assert!(recorder.evicted.lock().unwrap().is_empty());
    assert_eq!(cache.stats().limited_notifications, 1);
}

/// Signalling a dependency token invalidates the entry on next access.
#[test]
fn test_dependency_token_evicts() {
    let cache = cache(0);
    let recorder = Arc::new(Recorder::default());
    assert_ok!(cache.subscribe(recorder.clone()));

    let token = ChangeToken::new();
    assert_ok!(cache.set_value(
        "k".to_string(),
        1,
        ExpirationPolicy::never().with_dependency(token.clone()),
    ));
    assert_eq!(cache.get(&"k".to_string()), Some(1));

    token.signal();
    assert_eq!(cache.get(&"k".to_string()), None);
    assert_eq!(
        *recorder.evicted.lock().unwrap(),
        vec![("k".to_string(), EvictionReason::Depended)]
    );
}

/// Overwriting a tracked entry reports Replaced, explicit removal Removed.
#[test]
fn test_replace_and_remove_reasons() {
    let cache = cache(0);
    let recorder = Arc::new(Recorder::default());
    let id = assert_ok!(cache.subscribe(recorder.clone()));

    let tracked = || ExpirationPolicy::sliding(Duration::from_secs(60));
    assert_ok!(cache.set_value("k".to_string(), 1, tracked()));
    assert_ok!(cache.set_value("k".to_string(), 2, tracked()));
    assert_eq!(cache.remove(&"k".to_string()), Some(2));

    assert_eq!(
        *recorder.evicted.lock().unwrap(),
        vec![
            ("k".to_string(), EvictionReason::Replaced),
            ("k".to_string(), EvictionReason::Removed),
        ]
    );

    assert!(cache.unsubscribe(id));
    assert!(!cache.unsubscribe(id));
}

/// Concurrent get_or_create callers all observe the first stored value.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_or_create_first_value_wins() {
    let cache = Arc::new(cache(0));

    let mut callers = Vec::new();
    for i in 0..8 {
        let cache = Arc::clone(&cache);
        callers.push(tokio::spawn(async move {
            cache
                .get_or_create_async("k".to_string(), |_| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    (i, ExpirationPolicy::never())
                })
                .await
                .unwrap()
        }));
    }

    let mut values = Vec::new();
    for caller in callers {
        values.push(caller.await.unwrap());
    }
    let stored = cache.get(&"k".to_string()).unwrap();
    assert!(values.iter().all(|v| *v == stored), "values: {:?}", values);
}

/// The shared instance is a singleton that survives dispose().
#[test]
fn test_shared_cache_survives_dispose() {
    let shared = SharedCache::shared();
    assert!(shared.is_shared());
    assert!(std::ptr::eq(shared, SharedCache::shared()));

    let value: elohim_stash::cache::SharedValue = Arc::new(7u32);
    assert_ok!(shared.set_value(
        "integration-shared".to_string(),
        value,
        ExpirationPolicy::never(),
    ));
    shared.dispose();

    let stored = shared.get(&"integration-shared".to_string()).unwrap();
    assert_eq!(stored.downcast_ref::<u32>(), Some(&7));
}
