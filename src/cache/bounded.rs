//! Bounded cache
//!
//! Wraps a [`MemoryStore`], applies an [`ExpirationPolicy`] on every insert,
//! translates the store's removal causes into [`EvictionReason`]s and tells
//! listeners when the soft `count_limit` is exceeded. Exceeding it evicts
//! nothing; only the store's own `size_limit` does.
//!
//! Eviction notifications are delivered synchronously, on the thread that
//! detected the eviction, after the store has released its locks. Only
//! entries inserted with an expiration, a dependency or a callback are
//! reported.
//!
//! Expirations are detected by every cache operation and, when a tokio
//! runtime is available at construction, by a background purge running every
//! `purge_interval`, so an idle cache still reports `Expired`.
//!
//! After [`dispose`](BoundedCache::dispose), operations that would add state
//! (`set_value`, `get_or_create`, `subscribe`) fail with
//! `StashError::Disposed`; everything else behaves as on an empty cache.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::expiration::{
    EvictionCallback, EvictionNotification, EvictionReason, ExpirationPolicy, SharedValue,
};
use super::store::{EntryOptions, Eviction, MemoryStore};
use super::{BoundedCacheConfig, CacheStats};
use crate::buffer::timer::{weak_tick, PeriodicTimer};
use crate::types::{Result, StashError};

const NAME: &str = "BoundedCache";

/// Observer of cache-level events
pub trait CacheListener<K, V>: Send + Sync {
    /// The entry count exceeds `count_limit` by `overflow_by`.
    fn on_limited(&self, _overflow_by: usize, _count: usize) {}

    /// A tracked entry left the cache.
    fn on_evicted(&self, _notification: &EvictionNotification<K, V>) {}
}

/// Handle returned by [`BoundedCache::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Stored value plus what to do when it is evicted
struct Slot<K, V> {
    value: V,
    tracking: Option<Tracking<K, V>>,
}

struct Tracking<K, V> {
    state: Option<SharedValue>,
    callback: Option<EvictionCallback<K, V>>,
}

impl<K, V: Clone> Clone for Slot<K, V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            tracking: self.tracking.as_ref().map(|t| Tracking {
                state: t.state.clone(),
                callback: t.callback.clone(),
            }),
        }
    }
}

type Listeners<K, V> = Vec<(ListenerId, Arc<dyn CacheListener<K, V>>)>;

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    limited: AtomicU64,
    removed: AtomicU64,
    expired: AtomicU64,
    overfull: AtomicU64,
    replaced: AtomicU64,
    depended: AtomicU64,
}

/// Expiration-aware cache with a soft capacity limit.
pub struct BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<CacheInner<K, V>>,
    purge_timer: Option<PeriodicTimer>,
}

struct CacheInner<K, V> {
    store: MemoryStore<K, Slot<K, V>>,
    config: BoundedCacheConfig,
    listeners: RwLock<Listeners<K, V>>,
    next_listener: AtomicU64,
    counters: CacheCounters,
    shared: bool,
    disposed: AtomicBool,
}

/// The process-wide cache type: string keys, type-erased values
pub type SharedCache = BoundedCache<String, SharedValue>;

static SHARED: OnceLock<SharedCache> = OnceLock::new();

impl SharedCache {
    /// The process-wide cache. Created on first use from
    /// [`BoundedCacheConfig::from_env`], it lives for the rest of the process
    /// and is shared by every caller. [`dispose`](Self::dispose) on it is a
    /// no-op.
    ///
    /// It owns no purge timer, since it can outlive the runtime that first
    /// touched it. Expirations are reported by cache operations and
    /// [`purge_expired`](Self::purge_expired).
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| Self::build(BoundedCacheConfig::from_env(), true))
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache. Inside a tokio runtime it also starts the background
    /// purge when `purge_interval` is set.
    pub fn new(config: BoundedCacheConfig) -> Self {
        Self::build(config, false)
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(BoundedCacheConfig::default())
    }

    fn build(config: BoundedCacheConfig, shared: bool) -> Self {
        let config = config.normalized();
        let inner = Arc::new(CacheInner {
            store: MemoryStore::new(&config),
            config,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            counters: CacheCounters::default(),
            shared,
            disposed: AtomicBool::new(false),
        });

        let purge_timer = match inner.config.purge_interval {
            Some(interval) if !shared && tokio::runtime::Handle::try_current().is_ok() => {
                let tick = weak_tick(&inner, |inner: Arc<CacheInner<K, V>>| async move {
                    inner.purge_from_timer()
                });
                let timer = PeriodicTimer::new("cache-purge", interval, tick);
                match timer.start() {
                    Ok(()) => Some(timer),
                    Err(e) => {
                        warn!(error = %e, "Cache purge timer not started");
                        None
                    }
                }
            }
            _ => None,
        };

        let config = &inner.config;
        info!(
            count_limit = config.count_limit,
            size_limit = config.size_limit,
            scan_secs = config.expiration_scan_frequency.as_secs(),
            purge_ms = purge_timer.as_ref().map(|t| t.period().as_millis() as u64),
            shared,
            "BoundedCache initialized"
        );

        Self { inner, purge_timer }
    }

    /// Store `value` under `key` with `policy`, replacing any previous entry.
    pub fn set_value(&self, key: K, value: V, policy: ExpirationPolicy<K, V>) -> Result<()> {
        self.inner.set_value(key, value, policy)
    }

    /// Return the live value for `key`, or store the one `factory` builds.
    ///
    /// The factory runs outside any lock. Under contention it may run more
    /// than once; the first value stored wins and is returned to everyone.
    pub fn get_or_create<F>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> (V, ExpirationPolicy<K, V>),
    {
        self.inner.ensure_open()?;
        if let Some(value) = self.inner.get(&key) {
            return Ok(value);
        }

        let (value, policy) = factory(&key);
        self.inner.insert_created(key, value, policy)
    }

    /// [`get_or_create`](Self::get_or_create) with an async factory.
    pub async fn get_or_create_async<F, Fut>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = (V, ExpirationPolicy<K, V>)>,
    {
        self.inner.ensure_open()?;
        if let Some(value) = self.inner.get(&key) {
            return Ok(value);
        }

        let (value, policy) = factory(&key).await;
        self.inner.insert_created(key, value, policy)
    }

    /// Get a live value, refreshing its sliding expiration.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        !self.inner.is_disposed() && self.inner.store.contains_key(key)
    }

    /// Remove an entry, returning its value if it was still live.
    pub fn remove(&self, key: &K) -> Option<V> {
        if self.inner.is_disposed() {
            return None;
        }
        let mut evicted = Vec::new();
        let removed = self.inner.store.remove(key, &mut evicted);
        self.inner.dispatch(evicted);
        removed.map(|slot| slot.value)
    }

    /// Entries currently held
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Remove `percentage` (0.0 to 1.0) of the entries, expired and low
    /// priority first. Returns how many were removed.
    pub fn compact(&self, percentage: f64) -> usize {
        if self.inner.is_disposed() {
            return 0;
        }
        let mut evicted = Vec::new();
        let removed = self.inner.store.compact(percentage, &mut evicted);
        self.inner.dispatch(evicted);
        debug!(percentage, removed, "Cache compacted");
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        if self.inner.is_disposed() {
            return;
        }
        let mut evicted = Vec::new();
        let removed = self.inner.store.clear(&mut evicted);
        self.inner.dispatch(evicted);
        info!(removed, "Cache cleared");
    }

    /// Remove expired and dependency-invalidated entries now.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Register a listener for limit and eviction events.
    pub fn subscribe(&self, listener: Arc<dyn CacheListener<K, V>>) -> Result<ListenerId> {
        let mut listeners = self.inner.listeners.write()?;
        // Checked under the listener lock so dispose cannot clear the list
        // between the check and the push.
        self.inner.ensure_open()?;
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        listeners.push((id, listener));
        Ok(id)
    }

    /// Detach a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// Stop the background purge, detach every listener and release the
    /// store.
    ///
    /// Ignored on the [`shared`](BoundedCache::shared) instance. Entries are
    /// released without notifications.
    pub fn dispose(&self) {
        if self.inner.shared {
            warn!("Ignoring dispose() on the shared BoundedCache");
            return;
        }

        {
            let mut listeners = self
                .inner
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            listeners.clear();
        }

        if let Some(timer) = &self.purge_timer {
            timer.stop();
        }
        let released = self.inner.store.release();
        info!(released, "BoundedCache disposed");
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Whether this is the process-wide shared instance
    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// Background purge timer, absent for the shared instance or when built
    /// outside a tokio runtime
    pub fn purge_timer(&self) -> Option<&PeriodicTimer> {
        self.purge_timer.as_ref()
    }

    /// Get configuration
    pub fn config(&self) -> &BoundedCacheConfig {
        &self.inner.config
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            entries: self.inner.store.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            limited_notifications: c.limited.load(Ordering::Relaxed),
            evicted_removed: c.removed.load(Ordering::Relaxed),
            evicted_expired: c.expired.load(Ordering::Relaxed),
            evicted_overfull: c.overfull.load(Ordering::Relaxed),
            evicted_replaced: c.replaced.load(Ordering::Relaxed),
            evicted_depended: c.depended.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(StashError::Disposed(NAME));
        }
        Ok(())
    }

    fn set_value(&self, key: K, value: V, policy: ExpirationPolicy<K, V>) -> Result<()> {
        self.ensure_open()?;
        let (slot, options) = Self::slot(value, policy);

        let mut evicted = Vec::new();
        self.store.insert(key, slot, options, &mut evicted);
        self.dispatch(evicted);
        self.release_if_disposed()?;
        self.check_limit();
        Ok(())
    }

    fn get(&self, key: &K) -> Option<V> {
        if self.is_disposed() {
            return None;
        }
        let mut evicted = Vec::new();
        let found = self.store.get(key, &mut evicted);
        self.dispatch(evicted);

        match found {
            Some(slot) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn purge_expired(&self) -> usize {
        if self.is_disposed() {
            return 0;
        }
        let mut evicted = Vec::new();
        let removed = self.store.scan_expired(&mut evicted);
        self.dispatch(evicted);
        removed
    }

    fn purge_from_timer(&self) {
        let removed = self.purge_expired();
        if removed > 0 {
            debug!(removed, "Expired cache entries purged");
        }
    }

    fn slot(value: V, policy: ExpirationPolicy<K, V>) -> (Slot<K, V>, EntryOptions) {
        let options = EntryOptions {
            sliding: policy.expiration.sliding,
            absolute: policy.expiration.absolute_deadline(Instant::now()),
            priority: policy.priority,
            dependency: policy.dependency.clone(),
        };
        let tracking = policy.is_tracked().then(|| Tracking {
            state: policy.state,
            callback: policy.callback,
        });
        (Slot { value, tracking }, options)
    }

    fn insert_created(&self, key: K, value: V, policy: ExpirationPolicy<K, V>) -> Result<V> {
        let (slot, options) = Self::slot(value, policy);
        let mut evicted = Vec::new();
        let (stored, inserted) = self.store.insert_if_absent(key, slot, options, &mut evicted);
        self.dispatch(evicted);
        self.release_if_disposed()?;
        if inserted {
            self.check_limit();
        }
        Ok(stored.value)
    }

    /// An insert that raced with `dispose` must not leave entries behind.
    fn release_if_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            self.store.release();
            return Err(StashError::Disposed(NAME));
        }
        Ok(())
    }

    fn check_limit(&self) {
        let limit = self.config.count_limit;
        if limit == 0 {
            return;
        }
        let count = self.store.len();
        if count <= limit {
            return;
        }

        let overflow_by = count - limit;
        self.counters.limited.fetch_add(1, Ordering::Relaxed);
        warn!(count, limit, overflow_by, "BoundedCache over its count limit");

        for listener in self.listener_snapshot() {
            listener.on_limited(overflow_by, count);
        }
    }

    fn dispatch(&self, evicted: Vec<Eviction<K, Slot<K, V>>>) {
        if evicted.is_empty() {
            return;
        }
        let listeners = self.listener_snapshot();

        for eviction in evicted {
            let reason = EvictionReason::from(eviction.cause);
            self.count_eviction(reason);

            let Slot { value, tracking } = eviction.value;
            let Some(tracking) = tracking else {
                continue;
            };

            let notification = EvictionNotification {
                key: eviction.key,
                value,
                reason,
                state: tracking.state,
            };
            if let Some(callback) = &tracking.callback {
                callback(&notification);
            }
            for listener in &listeners {
                listener.on_evicted(&notification);
            }
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn CacheListener<K, V>>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn count_eviction(&self, reason: EvictionReason) {
        let c = &self.counters;
        let counter = match reason {
            EvictionReason::Removed => &c.removed,
            EvictionReason::Expired => &c.expired,
            EvictionReason::Overfull => &c.overfull,
            EvictionReason::Replaced => &c.replaced,
            EvictionReason::Depended => &c.depended,
            EvictionReason::None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
