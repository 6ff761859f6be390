//! Aggregation layer
//!
//! Components that fold many producer calls into a single sink invocation:
//!
//! - [`KeyedCounterAggregator`] keeps one counter per key and delivers the
//!   totals accumulated since the previous flush
//! - [`UnorderedCollector`] gathers items in no particular order and drains
//!   them live into the sink
//!
//! Both share the flush machinery of the [`buffer`](crate::buffer) layer:
//! a [`PeriodicTimer`](crate::buffer::PeriodicTimer) for time-triggered
//! flushes and a limit for capacity-triggered ones.

pub mod collector;
pub mod counter;

pub use collector::{CollectorDrain, UnorderedCollector};
pub use counter::KeyedCounterAggregator;

use std::time::Duration;

use serde::Serialize;

use crate::buffer::MIN_FLUSH_INTERVAL;
use crate::config::{env_interval_ms, env_parse};

/// A drained counter: the total accumulated for `key` during one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterEntry<K> {
    pub key: K,
    pub value: i64,
}

/// Configuration for [`KeyedCounterAggregator`]
#[derive(Debug, Clone, PartialEq)]
pub struct CounterAggregatorConfig {
    /// Distinct key count that triggers a flush (0 = unlimited)
    pub limit: usize,
    /// Timer flush interval (`None` = no timer)
    pub flush_interval: Option<Duration>,
}

impl Default for CounterAggregatorConfig {
    fn default() -> Self {
        Self {
            limit: 10_000,
            flush_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl CounterAggregatorConfig {
    /// Config optimized for many distinct keys
    pub fn for_throughput() -> Self {
        Self {
            limit: 100_000,
            flush_interval: Some(Duration::from_secs(30)),
        }
    }

    /// Config optimized for fresh totals
    pub fn for_interactive() -> Self {
        Self {
            limit: 1000,
            flush_interval: Some(Duration::from_secs(1)),
        }
    }

    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            limit: env_parse("STASH_COUNTER_LIMIT").unwrap_or(defaults.limit),
            flush_interval: env_interval_ms("STASH_COUNTER_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.flush_interval = self.flush_interval.map(|i| i.max(MIN_FLUSH_INTERVAL));
        self
    }
}

/// Configuration for [`UnorderedCollector`]
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Item count that triggers a flush (0 = unlimited)
    pub limit: usize,
    /// Timer flush interval (`None` = no timer)
    pub flush_interval: Option<Duration>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            limit: 1000,
            flush_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl CollectorConfig {
    pub fn for_throughput() -> Self {
        Self {
            limit: 10_000,
            flush_interval: Some(Duration::from_secs(5)),
        }
    }

    pub fn for_interactive() -> Self {
        Self {
            limit: 100,
            flush_interval: Some(Duration::from_millis(100)),
        }
    }

    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            limit: env_parse("STASH_COLLECTOR_LIMIT").unwrap_or(defaults.limit),
            flush_interval: env_interval_ms("STASH_COLLECTOR_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.flush_interval = self.flush_interval.map(|i| i.max(MIN_FLUSH_INTERVAL));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_config_presets() {
        assert_eq!(CounterAggregatorConfig::default().limit, 10_000);
        assert_eq!(CounterAggregatorConfig::for_interactive().limit, 1000);
        assert_eq!(
            CounterAggregatorConfig::for_throughput().flush_interval,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_collector_config_normalized() {
        let config = CollectorConfig {
            limit: 0,
            flush_interval: Some(Duration::from_millis(1)),
        }
        .normalized();
        assert_eq!(config.flush_interval, Some(MIN_FLUSH_INTERVAL));
    }

    #[test]
    fn test_counter_entry_serializes() {
        let entry = CounterEntry {
            key: "views".to_string(),
            value: 3,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"key":"views","value":3}"#);
    }
}
