//! Memory store implementation
//!
//! Concurrent in-memory store underneath [`BoundedCache`]. It owns expiration
//! (sliding, absolute, dependency tokens), opportunistic expiration scans and
//! the optional hard capacity. Operations never call back into user code:
//! every entry they destroy is appended to an `evicted` list the caller
//! dispatches once the store's locks are released.
//!
//! [`BoundedCache`]: super::BoundedCache

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::expiration::{CachePriority, ChangeToken, EvictionReason};
use super::BoundedCacheConfig;

/// Why the store destroyed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Removed without a recorded cause (store released)
    None,
    Removed,
    Replaced,
    Expired,
    /// A dependency token was signalled
    TokenExpired,
    /// Compacted away for capacity
    Capacity,
}

impl From<RemovalCause> for EvictionReason {
    fn from(cause: RemovalCause) -> Self {
        match cause {
            RemovalCause::Removed => EvictionReason::Removed,
            RemovalCause::Replaced => EvictionReason::Replaced,
            RemovalCause::Expired => EvictionReason::Expired,
            RemovalCause::TokenExpired => EvictionReason::Depended,
            RemovalCause::Capacity => EvictionReason::Overfull,
            RemovalCause::None => EvictionReason::None,
        }
    }
}

/// Expiration settings of one stored entry
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    pub sliding: Option<Duration>,
    /// Monotonic absolute deadline
    pub absolute: Option<Instant>,
    pub priority: CachePriority,
    pub dependency: Option<ChangeToken>,
}

/// An entry the store destroyed
#[derive(Debug)]
pub struct Eviction<K, V> {
    pub key: K,
    pub value: V,
    pub cause: RemovalCause,
}

struct StoreEntry<V> {
    value: V,
    options: EntryOptions,
    last_access: Instant,
}

impl<V> StoreEntry<V> {
    fn new(value: V, options: EntryOptions, now: Instant) -> Self {
        Self {
            value,
            options,
            last_access: now,
        }
    }

    /// Why this entry is no longer valid at `now`, if it is not
    fn invalid_at(&self, now: Instant) -> Option<RemovalCause> {
        if self.options.dependency.as_ref().is_some_and(ChangeToken::has_changed) {
            return Some(RemovalCause::TokenExpired);
        }
        if self.options.absolute.is_some_and(|deadline| now >= deadline) {
            return Some(RemovalCause::Expired);
        }
        if self
            .options
            .sliding
            .is_some_and(|idle| now.saturating_duration_since(self.last_access) >= idle)
        {
            return Some(RemovalCause::Expired);
        }
        None
    }
}

/// Concurrent store with expiration and optional hard capacity
pub struct MemoryStore<K, V> {
    entries: DashMap<K, StoreEntry<V>>,
    size_limit: Option<usize>,
    compaction_percentage: f64,
    scan_frequency: Duration,
    last_scan: Mutex<Instant>,
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: &BoundedCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            size_limit: config.size_limit,
            compaction_percentage: config.compaction_percentage,
            scan_frequency: config.expiration_scan_frequency,
            last_scan: Mutex::new(Instant::now()),
        }
    }

    /// Entries currently stored, including expired ones not yet scanned
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a live entry, refreshing its sliding window.
    pub fn get(&self, key: &K, evicted: &mut Vec<Eviction<K, V>>) -> Option<V> {
        let now = Instant::now();
        self.maybe_scan(now, evicted);

        let cause = {
            let mut entry = self.entries.get_mut(key)?;
            match entry.invalid_at(now) {
                None => {
                    entry.last_access = now;
                    return Some(entry.value.clone());
                }
                Some(cause) => cause,
            }
        };

        self.remove_invalid(key, cause, now, evicted);
        None
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.invalid_at(now).is_none())
    }

    /// Store `value`, replacing any previous entry.
    pub fn insert(&self, key: K, value: V, options: EntryOptions, evicted: &mut Vec<Eviction<K, V>>) {
        let now = Instant::now();
        self.maybe_scan(now, evicted);

        let previous = self
            .entries
            .insert(key.clone(), StoreEntry::new(value, options, now));
        if let Some(previous) = previous {
            let cause = previous.invalid_at(now).unwrap_or(RemovalCause::Replaced);
            evicted.push(Eviction {
                key,
                value: previous.value,
                cause,
            });
        }

        self.enforce_size_limit(evicted);
    }

    /// Store `value` unless a live entry exists. Returns the value that ends
    /// up stored and whether it was inserted.
    pub fn insert_if_absent(
        &self,
        key: K,
        value: V,
        options: EntryOptions,
        evicted: &mut Vec<Eviction<K, V>>,
    ) -> (V, bool) {
        let now = Instant::now();
        self.maybe_scan(now, evicted);

        let stored = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().invalid_at(now) {
                None => {
                    occupied.get_mut().last_access = now;
                    return (occupied.get().value.clone(), false);
                }
                Some(cause) => {
                    let previous = occupied.insert(StoreEntry::new(value.clone(), options, now));
                    evicted.push(Eviction {
                        key,
                        value: previous.value,
                        cause,
                    });
                    value
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(StoreEntry::new(value.clone(), options, now));
                value
            }
        };

        self.enforce_size_limit(evicted);
        (stored, true)
    }

    /// Remove an entry, live or not.
    pub fn remove(&self, key: &K, evicted: &mut Vec<Eviction<K, V>>) -> Option<V> {
        let now = Instant::now();
        self.maybe_scan(now, evicted);

        let (key, entry) = self.entries.remove(key)?;
        let live = entry.invalid_at(now).is_none();
        evicted.push(Eviction {
            key,
            value: entry.value.clone(),
            cause: entry.invalid_at(now).unwrap_or(RemovalCause::Removed),
        });
        live.then_some(entry.value)
    }

    /// Remove `percentage` of the entries: expired ones first, then by
    /// priority (lowest first) and least recent access. `NeverRemove`
    /// entries are skipped.
    pub fn compact(&self, percentage: f64, evicted: &mut Vec<Eviction<K, V>>) -> usize {
        let percentage = if percentage.is_finite() { percentage.clamp(0.0, 1.0) } else { 0.0 };
        let target = (self.entries.len() as f64 * percentage).ceil() as usize;
        self.compact_to(target, evicted)
    }

    /// Remove every entry, `NeverRemove` included.
    pub fn clear(&self, evicted: &mut Vec<Eviction<K, V>>) -> usize {
        let now = Instant::now();
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let before = evicted.len();
        for key in keys {
            if let Some((key, entry)) = self.entries.remove(&key) {
                let cause = entry.invalid_at(now).unwrap_or(RemovalCause::Removed);
                evicted.push(Eviction {
                    key,
                    value: entry.value,
                    cause,
                });
            }
        }
        evicted.len() - before
    }

    /// Drop every entry without reporting any of them.
    pub fn release(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Remove every entry that is expired or whose dependency changed.
    pub fn scan_expired(&self, evicted: &mut Vec<Eviction<K, V>>) -> usize {
        let now = Instant::now();
        *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = now;
        self.remove_expired_at(now, evicted)
    }

    fn maybe_scan(&self, now: Instant, evicted: &mut Vec<Eviction<K, V>>) {
        let due = {
            // Another thread already scanning is as good as scanning.
            let Ok(mut last_scan) = self.last_scan.try_lock() else {
                return;
            };
            if now.saturating_duration_since(*last_scan) < self.scan_frequency {
                false
            } else {
                *last_scan = now;
                true
            }
        };

        if due {
            let removed = self.remove_expired_at(now, evicted);
            if removed > 0 {
                debug!(removed, "Expiration scan removed entries");
            }
        }
    }

    fn remove_expired_at(&self, now: Instant, evicted: &mut Vec<Eviction<K, V>>) -> usize {
        let expired: Vec<(K, RemovalCause)> = self
            .entries
            .iter()
            .filter_map(|entry| entry.invalid_at(now).map(|cause| (entry.key().clone(), cause)))
            .collect();

        let before = evicted.len();
        for (key, cause) in expired {
            self.remove_invalid(&key, cause, now, evicted);
        }
        evicted.len() - before
    }

    /// Remove `key` if it is still invalid; it may have been replaced since
    /// it was inspected.
    fn remove_invalid(
        &self,
        key: &K,
        cause: RemovalCause,
        now: Instant,
        evicted: &mut Vec<Eviction<K, V>>,
    ) {
        if let Some((key, entry)) = self
            .entries
            .remove_if(key, |_, entry| entry.invalid_at(now).is_some())
        {
            evicted.push(Eviction {
                key,
                value: entry.value,
                cause,
            });
        }
    }

    fn compact_to(&self, target: usize, evicted: &mut Vec<Eviction<K, V>>) -> usize {
        if target == 0 {
            return 0;
        }
        let now = Instant::now();
        let expired = self.remove_expired_at(now, evicted);
        let mut remaining = target.saturating_sub(expired);
        if remaining == 0 {
            return expired;
        }

        let mut candidates: Vec<(K, CachePriority, Instant)> = self
            .entries
            .iter()
            .filter(|entry| entry.options.priority != CachePriority::NeverRemove)
            .map(|entry| (entry.key().clone(), entry.options.priority, entry.last_access))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut removed = expired;
        for (key, _, _) in candidates {
            if remaining == 0 {
                break;
            }
            if let Some((key, entry)) = self.entries.remove(&key) {
                evicted.push(Eviction {
                    key,
                    value: entry.value,
                    cause: RemovalCause::Capacity,
                });
                removed += 1;
                remaining -= 1;
            }
        }

        debug!(target, removed, "Store compacted");
        removed
    }

    fn enforce_size_limit(&self, evicted: &mut Vec<Eviction<K, V>>) {
        let Some(limit) = self.size_limit else {
            return;
        };
        let count = self.entries.len();
        if count <= limit {
            return;
        }

        let by_percentage = (count as f64 * self.compaction_percentage).ceil() as usize;
        self.compact_to(by_percentage.max(count - limit), evicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(config: BoundedCacheConfig) -> MemoryStore<String, u32> {
        MemoryStore::new(&config)
    }

    fn sliding(ms: u64) -> EntryOptions {
        EntryOptions {
            sliding: Some(Duration::from_millis(ms)),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_get_replace() {
        let store = store(BoundedCacheConfig::default());
        let mut evicted = Vec::new();

        store.insert("a".into(), 1, EntryOptions::default(), &mut evicted);
        assert_eq!(store.get(&"a".into(), &mut evicted), Some(1));
        assert!(evicted.is_empty());

        store.insert("a".into(), 2, EntryOptions::default(), &mut evicted);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].value, 1);
        assert_eq!(evicted[0].cause, RemovalCause::Replaced);
        assert_eq!(store.get(&"a".into(), &mut evicted), Some(2));
    }

    #[test]
    fn test_sliding_entry_expires_without_access() {
        let store = store(BoundedCacheConfig::default());
        let mut evicted = Vec::new();
        store.insert("s".into(), 1, sliding(30), &mut evicted);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.get(&"s".into(), &mut evicted), None);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].cause, RemovalCause::Expired);
    }

    #[test]
    fn test_access_refreshes_sliding_window() {
        let store = store(BoundedCacheConfig::default());
        let mut evicted = Vec::new();
        store.insert("s".into(), 1, sliding(80), &mut evicted);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(store.get(&"s".into(), &mut evicted), Some(1));
        }
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_dependency_signal_invalidates() {
        let store = store(BoundedCacheConfig::default());
        let mut evicted = Vec::new();
        let token = ChangeToken::new();
        let options = EntryOptions {
            dependency: Some(token.clone()),
            ..Default::default()
        };
        store.insert("d".into(), 1, options, &mut evicted);
        assert!(store.contains_key(&"d".into()));

        token.signal();
        assert!(!store.contains_key(&"d".into()));
        assert_eq!(store.scan_expired(&mut evicted), 1);
        assert_eq!(evicted[0].cause, RemovalCause::TokenExpired);
    }

    #[test]
    fn test_compact_respects_priority() {
        let store = store(BoundedCacheConfig::default());
        let mut evicted = Vec::new();
        let with = |priority| EntryOptions {
            priority,
            ..Default::default()
        };

        store.insert("keep".into(), 0, with(CachePriority::NeverRemove), &mut evicted);
        store.insert("high".into(), 1, with(CachePriority::High), &mut evicted);
        store.insert("low".into(), 2, with(CachePriority::Low), &mut evicted);
        store.insert("normal".into(), 3, with(CachePriority::Normal), &mut evicted);

        assert_eq!(store.compact(0.5, &mut evicted), 2);
        let removed: Vec<&str> = evicted.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(removed, vec!["low", "normal"]);
        assert!(evicted.iter().all(|e| e.cause == RemovalCause::Capacity));

        evicted.clear();
        assert_eq!(store.compact(1.0, &mut evicted), 1);
        assert!(store.contains_key(&"keep".into()));

        assert_eq!(store.clear(&mut evicted), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_size_limit_evicts_overfull() {
        let config = BoundedCacheConfig {
            size_limit: Some(3),
            compaction_percentage: 0.0,
            ..Default::default()
        };
        let store = store(config);
        let mut evicted = Vec::new();

        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            store.insert(key.to_string(), i as u32, EntryOptions::default(), &mut evicted);
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(store.len(), 3);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "a");
        assert_eq!(evicted[0].cause, RemovalCause::Capacity);
    }

    #[test]
    fn test_insert_if_absent_keeps_live_value() {
        let store = store(BoundedCacheConfig::default());
        let mut evicted = Vec::new();

        assert_eq!(store.insert_if_absent("k".into(), 1, EntryOptions::default(), &mut evicted), (1, true));
        assert_eq!(store.insert_if_absent("k".into(), 2, EntryOptions::default(), &mut evicted), (1, false));
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_opportunistic_scan() {
        let config = BoundedCacheConfig {
            expiration_scan_frequency: Duration::from_millis(20),
            ..Default::default()
        };
        let store = store(config);
        let mut evicted = Vec::new();
        store.insert("old".into(), 1, sliding(10), &mut evicted);

        std::thread::sleep(Duration::from_millis(40));
        store.insert("new".into(), 2, EntryOptions::default(), &mut evicted);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "old");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cause_translation() {
        assert_eq!(EvictionReason::from(RemovalCause::Capacity), EvictionReason::Overfull);
        assert_eq!(EvictionReason::from(RemovalCause::TokenExpired), EvictionReason::Depended);
        assert_eq!(EvictionReason::from(RemovalCause::None), EvictionReason::None);
    }
}
