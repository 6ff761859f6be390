//! Configuration for elohim-stash
//!
//! Environment helpers shared by the component `from_env()` constructors, and
//! the CLI arguments of the `stash-soak` binary.

use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

/// Read and parse an environment variable, ignoring unset or malformed values.
pub(crate) fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Read a millisecond interval. `0` disables the interval.
pub(crate) fn env_interval_ms(name: &str) -> Option<Option<Duration>> {
    env_parse::<u64>(name).map(|ms| (ms > 0).then(|| Duration::from_millis(ms)))
}

/// stash-soak - concurrency soak test for the stash buffers
///
/// Hammers a BatchBuffer and a KeyedCounterAggregator from many producers
/// against a slow sink and verifies nothing is lost or double counted.
#[derive(Parser, Debug, Clone)]
#[command(name = "stash-soak")]
#[command(about = "Soak test for elohim-stash aggregation buffers")]
pub struct Args {
    /// Number of concurrent producer tasks
    #[arg(long, env = "SOAK_PRODUCERS", default_value = "8")]
    pub producers: usize,

    /// How long producers run, in seconds
    #[arg(long, env = "SOAK_DURATION_SECS", default_value = "5")]
    pub duration_secs: u64,

    /// Item-count limit that triggers a flush (0 = timer only)
    #[arg(long, env = "STASH_BATCH_LIMIT", default_value = "500")]
    pub limit: usize,

    /// Timer flush interval in milliseconds (0 = no timer)
    #[arg(long, env = "STASH_FLUSH_INTERVAL_MS", default_value = "100")]
    pub flush_interval_ms: u64,

    /// Simulated sink latency in milliseconds
    #[arg(long, env = "SOAK_SINK_LATENCY_MS", default_value = "20")]
    pub sink_latency_ms: u64,

    /// Number of distinct counter keys
    #[arg(long, env = "SOAK_KEYS", default_value = "64")]
    pub keys: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.producers == 0 {
            return Err("SOAK_PRODUCERS must be at least 1".to_string());
        }
        if self.keys == 0 {
            return Err("SOAK_KEYS must be at least 1".to_string());
        }
        if self.duration_secs == 0 {
            return Err("SOAK_DURATION_SECS must be at least 1".to_string());
        }
        Ok(())
    }

    /// Timer interval, `None` when disabled
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }
}
