//! Keyed Counter Aggregator
//!
//! One counter per key in a sharded map. `increase` creates or adds under the
//! key's shard lock, and a flush removes each key under the same lock. An
//! increment racing with a flush is therefore either part of the removed
//! total or starts the next epoch, never both and never neither.

use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CounterAggregatorConfig, CounterEntry};
use crate::buffer::flush::{FlushCounters, FlushGate, FlushStats};
use crate::buffer::timer::weak_tick;
use crate::buffer::{Batch, BufferPool, PeriodicTimer, Sink};
use crate::types::{Result, StashError};

const NAME: &str = "KeyedCounterAggregator";

/// Per-key counters drained to a sink in one batch per flush.
pub struct KeyedCounterAggregator<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    inner: Arc<CounterInner<K>>,
    timer: Option<PeriodicTimer>,
}

struct CounterInner<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    counters: DashMap<K, i64>,
    /// Cleared by shutdown. Increments hold the read side while they touch
    /// the map, so none can land after the final flush.
    open: RwLock<bool>,
    limit: usize,
    pool: Arc<BufferPool<CounterEntry<K>>>,
    sink: Box<dyn Sink<Batch<CounterEntry<K>>>>,
    gate: FlushGate,
    stats: FlushCounters,
}

impl<K> KeyedCounterAggregator<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new<S>(config: CounterAggregatorConfig, sink: S) -> Result<Self>
    where
        S: Sink<Batch<CounterEntry<K>>>,
    {
        let config = config.normalized();
        let inner = Arc::new(CounterInner {
            counters: DashMap::new(),
            open: RwLock::new(true),
            limit: config.limit,
            pool: BufferPool::for_limit(config.limit),
            sink: Box::new(sink),
            gate: FlushGate::new(),
            stats: FlushCounters::default(),
        });

        let timer = match config.flush_interval {
            Some(interval) => {
                let tick = weak_tick(&inner, |inner: Arc<CounterInner<K>>| async move {
                    inner.flush_from_timer().await
                });
                let timer = PeriodicTimer::new("keyed-counter", interval, tick);
                timer.start()?;
                Some(timer)
            }
            None => None,
        };

        info!(
            limit = config.limit,
            interval_ms = config.flush_interval.map(|i| i.as_millis() as u64),
            "KeyedCounterAggregator initialized"
        );

        Ok(Self { inner, timer })
    }

    /// Add `delta` to the counter for `key`, creating it at `delta`.
    ///
    /// Flushes before returning once the number of distinct keys reaches the
    /// limit.
    pub async fn increase(&self, key: K, delta: i64) -> Result<()> {
        let distinct = {
            let open = self.inner.open.read()?;
            if !*open {
                return Err(StashError::Disposed(NAME));
            }
            self.inner
                .counters
                .entry(key)
                .and_modify(|value| *value = value.saturating_add(delta))
                .or_insert(delta);
            self.inner.counters.len()
        };

        if self.inner.limit > 0 && distinct >= self.inner.limit {
            self.inner.flush_on_capacity().await?;
        }
        Ok(())
    }

    /// Add one to the counter for `key`.
    pub async fn increment(&self, key: K) -> Result<()> {
        self.increase(key, 1).await
    }

    /// Current live value for `key`, `None` if it has not been touched this epoch
    pub fn get(&self, key: &K) -> Option<i64> {
        self.inner.counters.get(key).map(|value| *value)
    }

    /// Distinct keys in the current epoch
    pub fn len(&self) -> usize {
        self.inner.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.counters.is_empty()
    }

    /// Drain every counter into the sink, waiting for a flush in progress.
    pub async fn flush(&self) -> Result<()> {
        self.flush_cancellable(&CancellationToken::new()).await
    }

    pub async fn flush_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &*self.inner;
        inner.gate.run(cancel, move || inner.flush_once()).await
    }

    /// Stop accepting increments and persist the outstanding counters.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        {
            let mut open = self.inner.open.write()?;
            if !*open {
                return Ok(());
            }
            *open = false;
        }

        info!(keys = self.len(), "KeyedCounterAggregator shutting down");
        self.flush().await
    }

    /// Flush timer, for changing the period at runtime
    pub fn timer(&self) -> Option<&PeriodicTimer> {
        self.timer.as_ref()
    }

    /// Get flush statistics
    pub fn stats(&self) -> FlushStats {
        self.inner.stats.snapshot()
    }
}

impl<K> CounterInner<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    async fn flush_once(&self) -> Result<()> {
        let keys: Vec<K> = self.counters.iter().map(|entry| entry.key().clone()).collect();
        if keys.is_empty() {
            return Ok(());
        }

        let mut batch = self.pool.rent_batch();
        for key in keys {
            if let Some((key, value)) = self.counters.remove(&key) {
                batch.push(CounterEntry { key, value });
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let count = batch.len();
        let started = Instant::now();
        let outcome = self.sink.consume(batch).await.map_err(StashError::from);

        self.stats.record(started, &outcome);
        if outcome.is_ok() {
            self.stats.add_items(count);
        }
        debug!(
            keys = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Counters flushed"
        );
        outcome
    }

    async fn flush_on_capacity(&self) -> Result<()> {
        if !self.gate.run_or_defer(move || self.flush_once()).await? {
            self.stats.record_deferred();
        }
        Ok(())
    }

    async fn flush_from_timer(&self) {
        match self.gate.run_or_defer(move || self.flush_once()).await {
            Ok(true) => {}
            Ok(false) => self.stats.record_deferred(),
            Err(e) => error!(error = %e, "Timer-triggered counter flush failed"),
        }
    }
}

impl<K> Drop for KeyedCounterAggregator<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let remaining = self.inner.counters.len();
        if remaining > 0 {
            warn!(remaining, "KeyedCounterAggregator dropped with unflushed counters, call shutdown() to keep them");
        }
    }
}
