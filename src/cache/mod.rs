//! Bounded cache layer
//!
//! An in-memory key/value cache with a unified expiration model:
//!
//! - [`expiration`] holds the policy types: sliding and absolute expiration,
//!   priority, dependency tokens and eviction callbacks
//! - [`store`] is the underlying concurrent store that enforces expiration
//!   and hard capacity
//! - [`bounded`] wraps the store, applies policies on insert, translates
//!   eviction causes and raises soft-capacity notifications
//!
//! ## Soft vs hard capacity
//!
//! `count_limit` only notifies listeners (`on_limited`). `size_limit`, when
//! set, makes the store evict low priority, least recently used entries.

pub mod bounded;
pub mod expiration;
pub mod store;

pub use bounded::{BoundedCache, CacheListener, ListenerId, SharedCache};
pub use expiration::{
    CachePriority, ChangeToken, EvictionCallback, EvictionNotification, EvictionReason,
    Expiration, ExpirationPolicy, SharedValue,
};
pub use store::{EntryOptions, Eviction, MemoryStore, RemovalCause};

use std::time::Duration;

use serde::Serialize;

use crate::buffer::MIN_FLUSH_INTERVAL;
use crate::config::{env_interval_ms, env_parse};

/// Default background purge period. Keeps the delay between an entry
/// expiring and its `Expired` notification well under 100ms.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_millis(25);

/// Bounded cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedCacheConfig {
    /// Entry count above which listeners are told the cache is over its
    /// limit (0 = unlimited). Nothing is evicted because of it.
    pub count_limit: usize,
    /// Hard entry count the store enforces by compacting (`None` = unbounded)
    pub size_limit: Option<usize>,
    /// Period of the background purge that reports expirations on an idle
    /// cache (`None` = only scan during cache operations)
    pub purge_interval: Option<Duration>,
    /// Minimum time between two opportunistic expiration scans
    pub expiration_scan_frequency: Duration,
    /// Fraction of entries removed when the store compacts for capacity
    pub compaction_percentage: f64,
}

impl Default for BoundedCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: 10_000,
            size_limit: None,
            purge_interval: Some(DEFAULT_PURGE_INTERVAL),
            expiration_scan_frequency: Duration::from_secs(60),
            compaction_percentage: 0.05,
        }
    }
}

impl BoundedCacheConfig {
    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let size_limit = match env_parse::<usize>("STASH_CACHE_SIZE_LIMIT") {
            Some(0) => None,
            Some(limit) => Some(limit),
            None => defaults.size_limit,
        };

        Self {
            count_limit: env_parse("STASH_CACHE_COUNT_LIMIT").unwrap_or(defaults.count_limit),
            size_limit,
            purge_interval: env_interval_ms("STASH_CACHE_PURGE_INTERVAL_MS")
                .unwrap_or(defaults.purge_interval),
            expiration_scan_frequency: env_parse("STASH_CACHE_SCAN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.expiration_scan_frequency),
            compaction_percentage: env_parse("STASH_CACHE_COMPACTION_PERCENTAGE")
                .unwrap_or(defaults.compaction_percentage),
        }
        .normalized()
    }

    /// Clamp the compaction percentage into `[0, 1]`, the scan frequency
    /// to at least one millisecond and the purge interval to
    /// [`MIN_FLUSH_INTERVAL`].
    pub fn normalized(mut self) -> Self {
        self.purge_interval = self.purge_interval.map(|i| i.max(MIN_FLUSH_INTERVAL));
        self.compaction_percentage = if self.compaction_percentage.is_finite() {
            self.compaction_percentage.clamp(0.0, 1.0)
        } else {
            Self::default().compaction_percentage
        };
        self.expiration_scan_frequency = self.expiration_scan_frequency.max(Duration::from_millis(1));
        if self.size_limit == Some(0) {
            self.size_limit = None;
        }
        self
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Times `on_limited` fired
    pub limited_notifications: u64,
    pub evicted_removed: u64,
    pub evicted_expired: u64,
    pub evicted_overfull: u64,
    pub evicted_replaced: u64,
    pub evicted_depended: u64,
}

impl CacheStats {
    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Evictions across every reason
    pub fn evictions(&self) -> u64 {
        self.evicted_removed
            + self.evicted_expired
            + self.evicted_overfull
            + self.evicted_replaced
            + self.evicted_depended
    }
}
