//! Elohim Stash - Buffered aggregation and bounded-cache primitives
//!
//! Building blocks for services that absorb many small writes and persist
//! them in batches:
//!
//! - [`buffer`]: swap-based [`BatchBuffer`] and channel-backed
//!   [`StreamedBuffer`], plus the timer, pool and sink they are built from
//! - [`aggregate`]: per-key counters and an unordered collector
//! - [`cache`]: an expiration-aware cache with a soft capacity limit and a
//!   process-wide shared instance
//!
//! Every sink call happens outside the component's internal locks, so a
//! slow sink never blocks producers beyond a short critical section.

pub mod aggregate;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod types;

pub use aggregate::{
    CollectorConfig, CounterAggregatorConfig, CounterEntry, KeyedCounterAggregator,
    UnorderedCollector,
};
pub use buffer::{
    sink_fn, Batch, BatchBuffer, BatchBufferConfig, BufferPool, FlushStats, PeriodicTimer, Sink,
    StreamedBuffer, StreamedBufferConfig,
};
pub use cache::{
    BoundedCache, BoundedCacheConfig, CacheListener, CachePriority, ChangeToken,
    EvictionNotification, EvictionReason, Expiration, ExpirationPolicy, SharedCache,
};
pub use types::{Result, StashError};
