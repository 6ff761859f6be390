//! Buffering layer
//!
//! Accumulates items produced by many concurrent callers and hands them to a
//! sink in batches, on a timer tick or once an item-count limit is reached.
//!
//! ## Strategies
//!
//! Two strategies with different guarantees live side by side:
//!
//! - **Swap** ([`BatchBuffer`]): the live buffer is swapped for a pooled empty
//!   one under a short lock, and the swapped-out buffer goes to the sink
//!   outside the lock. Each item lands in exactly one batch, in append order.
//! - **Live drain** ([`StreamedBuffer`], and the
//!   [`UnorderedCollector`](crate::aggregate::UnorderedCollector)): the sink
//!   pulls items straight off the shared queue. No allocation churn, but items
//!   produced while the sink runs may or may not be part of that flush.
//!
//! ## Building blocks
//!
//! - [`PeriodicTimer`] drives time-triggered flushes
//! - [`BufferPool`] recycles batch containers between flush cycles
//! - [`Sink`] is the consumer contract, [`sink_fn`] adapts an async closure

pub mod batch;
pub(crate) mod flush;
pub mod pool;
pub mod sink;
pub mod streamed;
pub mod timer;

pub use batch::BatchBuffer;
pub use flush::FlushStats;
pub use pool::{Batch, BufferPool, PoolStats};
pub use sink::{sink_fn, Sink, SinkFn};
pub use streamed::{StreamedBuffer, StreamedDrain};
pub use timer::{PeriodicTimer, TickFn, MIN_FLUSH_INTERVAL};

use std::time::Duration;

use crate::config::{env_interval_ms, env_parse};

/// Configuration for [`BatchBuffer`]
#[derive(Debug, Clone, PartialEq)]
pub struct BatchBufferConfig {
    /// Item count that triggers a flush (0 = unlimited, timer only)
    pub limit: usize,
    /// Timer flush interval (`None` = no timer)
    pub flush_interval: Option<Duration>,
}

impl Default for BatchBufferConfig {
    fn default() -> Self {
        Self {
            limit: 1000,
            flush_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl BatchBufferConfig {
    /// Config optimized for high-volume producers
    pub fn for_throughput() -> Self {
        Self {
            limit: 5000,
            flush_interval: Some(Duration::from_secs(5)),
        }
    }

    /// Config optimized for low latency
    pub fn for_interactive() -> Self {
        Self {
            limit: 50,
            flush_interval: Some(Duration::from_millis(100)),
        }
    }

    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            limit: env_parse("STASH_BATCH_LIMIT").unwrap_or(defaults.limit),
            flush_interval: env_interval_ms("STASH_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval),
        }
        .normalized()
    }

    /// Clamp the flush interval to [`MIN_FLUSH_INTERVAL`].
    pub fn normalized(mut self) -> Self {
        self.flush_interval = self.flush_interval.map(|i| i.max(MIN_FLUSH_INTERVAL));
        self
    }
}

/// Configuration for [`StreamedBuffer`]
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedBufferConfig {
    /// Queue capacity (0 = unbounded). A full queue forces a flush.
    pub capacity: usize,
    /// Timer flush interval (`None` = no timer)
    pub flush_interval: Option<Duration>,
}

impl Default for StreamedBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            flush_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl StreamedBufferConfig {
    /// Config optimized for high-volume producers
    pub fn for_throughput() -> Self {
        Self {
            capacity: 50_000,
            flush_interval: Some(Duration::from_secs(5)),
        }
    }

    /// Config optimized for low latency
    pub fn for_interactive() -> Self {
        Self {
            capacity: 500,
            flush_interval: Some(Duration::from_millis(100)),
        }
    }

    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capacity: env_parse("STASH_QUEUE_CAPACITY").unwrap_or(defaults.capacity),
            flush_interval: env_interval_ms("STASH_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval),
        }
        .normalized()
    }

    /// Clamp the flush interval to [`MIN_FLUSH_INTERVAL`].
    pub fn normalized(mut self) -> Self {
        self.flush_interval = self.flush_interval.map(|i| i.max(MIN_FLUSH_INTERVAL));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BatchBufferConfig::default();
        assert_eq!(config.limit, 1000);
        assert_eq!(config.flush_interval, Some(Duration::from_secs(1)));

        let streamed = StreamedBufferConfig::default();
        assert_eq!(streamed.capacity, 10_000);
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(BatchBufferConfig::for_throughput().limit, 5000);
        assert_eq!(BatchBufferConfig::for_interactive().limit, 50);
        assert_eq!(StreamedBufferConfig::for_interactive().capacity, 500);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = BatchBufferConfig {
            limit: 0,
            flush_interval: Some(Duration::ZERO),
        }
        .normalized();
        assert_eq!(config.flush_interval, Some(MIN_FLUSH_INTERVAL));

        let config = StreamedBufferConfig {
            capacity: 0,
            flush_interval: None,
        }
        .normalized();
        assert_eq!(config.flush_interval, None);
    }
}
