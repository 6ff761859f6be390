//! Unordered Collector - Append-only live-drain collection
//!
//! Items are pushed onto a lock-free queue and a flush hands the sink a
//! [`CollectorDrain`] that pops from that same queue.
//!
//! Known race: there is no swap. The drain is bounded to the length observed
//! when the flush started, so appends made while the sink runs normally wait
//! for the next cycle. An append racing with that length read can still land
//! in either cycle. Items are never lost or duplicated, but the batch is not a
//! point-in-time snapshot the way a [`BatchBuffer`](crate::buffer::BatchBuffer)
//! batch is.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CollectorConfig;
use crate::buffer::flush::{FlushCounters, FlushGate, FlushStats};
use crate::buffer::timer::weak_tick;
use crate::buffer::{PeriodicTimer, Sink};
use crate::types::{Result, StashError};

const NAME: &str = "UnorderedCollector";

/// Lazy sequence handed to an [`UnorderedCollector`] sink.
///
/// Yields at most as many items as were queued when the flush started.
/// Whatever the sink does not pull stays queued.
pub struct CollectorDrain<T> {
    queue: Arc<SegQueue<T>>,
    remaining: usize,
    stats: Arc<FlushCounters>,
}

impl<T> Iterator for CollectorDrain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.queue.pop()?;
        self.remaining -= 1;
        self.stats.add_items(1);
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// Order-agnostic collector drained live into its sink.
pub struct UnorderedCollector<T: Send + 'static> {
    inner: Arc<CollectorInner<T>>,
    timer: Option<PeriodicTimer>,
}

struct CollectorInner<T: Send + 'static> {
    queue: Arc<SegQueue<T>>,
    /// Cleared by shutdown; appends hold the read side while pushing.
    open: RwLock<bool>,
    limit: usize,
    sink: Box<dyn Sink<CollectorDrain<T>>>,
    gate: FlushGate,
    stats: Arc<FlushCounters>,
}

impl<T: Send + 'static> UnorderedCollector<T> {
    pub fn new<S>(config: CollectorConfig, sink: S) -> Result<Self>
    where
        S: Sink<CollectorDrain<T>>,
    {
        let config = config.normalized();
        let inner = Arc::new(CollectorInner {
            queue: Arc::new(SegQueue::new()),
            open: RwLock::new(true),
            limit: config.limit,
            sink: Box::new(sink),
            gate: FlushGate::new(),
            stats: Arc::new(FlushCounters::default()),
        });

        let timer = match config.flush_interval {
            Some(interval) => {
                let tick = weak_tick(&inner, |inner: Arc<CollectorInner<T>>| async move {
                    inner.flush_from_timer().await
                });
                let timer = PeriodicTimer::new("unordered-collector", interval, tick);
                timer.start()?;
                Some(timer)
            }
            None => None,
        };

        info!(
            limit = config.limit,
            interval_ms = config.flush_interval.map(|i| i.as_millis() as u64),
            "UnorderedCollector initialized"
        );

        Ok(Self { inner, timer })
    }

    /// Add an item. Flushes before returning once the limit is reached.
    pub async fn append(&self, item: T) -> Result<()> {
        let len = {
            let open = self.inner.open.read()?;
            if !*open {
                return Err(StashError::Disposed(NAME));
            }
            self.inner.queue.push(item);
            self.inner.queue.len()
        };

        let inner = &*self.inner;
        if inner.limit > 0 && len >= inner.limit && !inner.gate.run_or_defer(move || inner.flush_once()).await? {
            inner.stats.record_deferred();
        }
        Ok(())
    }

    /// Hand the queued items to the sink if there are any.
    pub async fn flush(&self) -> Result<()> {
        self.flush_cancellable(&CancellationToken::new()).await
    }

    pub async fn flush_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &*self.inner;
        inner.gate.run(cancel, move || inner.flush_once()).await
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Stop accepting items and flush what is left.
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

        info!(pending = self.len(), "UnorderedCollector shutting down");
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

impl<T: Send + 'static> CollectorInner<T> {
    async fn flush_once(&self) -> Result<()> {
        let remaining = self.queue.len();
        if remaining == 0 {
            return Ok(());
        }

        let drain = CollectorDrain {
            queue: Arc::clone(&self.queue),
            remaining,
            stats: Arc::clone(&self.stats),
        };

        let started = Instant::now();
        let outcome = self.sink.consume(drain).await.map_err(StashError::from);
        self.stats.record(started, &outcome);
        debug!(
            queued_at_start = remaining,
            left = self.queue.len(),
            ok = outcome.is_ok(),
            "UnorderedCollector flushed"
        );
        outcome
    }

    async fn flush_from_timer(&self) {
        match self.gate.run_or_defer(move || self.flush_once()).await {
            Ok(true) => {}
            Ok(false) => self.stats.record_deferred(),
            Err(e) => error!(error = %e, "Timer-triggered collector flush failed"),
        }
    }
}

impl<T: Send + 'static> Drop for UnorderedCollector<T> {
    fn drop(&mut self) {
        let remaining = self.inner.queue.len();
        if remaining > 0 {
            warn!(remaining, "UnorderedCollector dropped with unflushed items, call shutdown() to keep them");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::sink_fn;
    use std::sync::Mutex;
    use std::time::Duration;

    type Delivered = Arc<Mutex<Vec<Vec<u32>>>>;

    fn collecting_sink(delivered: Delivered) -> impl Sink<CollectorDrain<u32>> {
        sink_fn(move |drain: CollectorDrain<u32>| {
            let delivered = Arc::clone(&delivered);
            async move {
                let mut items: Vec<u32> = drain.collect();
                items.sort_unstable();
                delivered.lock().unwrap().push(items);
                Ok(())
            }
        })
    }

    fn manual(limit: usize) -> CollectorConfig {
        CollectorConfig {
            limit,
            flush_interval: None,
        }
    }

    #[tokio::test]
    async fn test_limit_triggers_flush() {
        let delivered = Delivered::default();
        let collector = UnorderedCollector::new(manual(3), collecting_sink(Arc::clone(&delivered))).unwrap();

        for i in 1..=4 {
            collector.append(i).await.unwrap();
        }
        assert_eq!(*delivered.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(collector.len(), 1);
        assert_eq!(collector.stats().items_flushed, 3);
    }

    #[tokio::test]
    async fn test_empty_flush_skips_sink() {
        let delivered = Delivered::default();
        let collector = UnorderedCollector::new(manual(0), collecting_sink(Arc::clone(&delivered))).unwrap();
        collector.flush().await.unwrap();
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_appends_during_sink_wait_for_next_cycle() {
        let collector_slot: Arc<Mutex<Option<Arc<SegQueue<u32>>>>> = Arc::default();
        let delivered = Delivered::default();

        let (slot, sink_delivered) = (Arc::clone(&collector_slot), Arc::clone(&delivered));
        let sink = sink_fn(move |drain: CollectorDrain<u32>| {
            let (slot, delivered) = (Arc::clone(&slot), Arc::clone(&sink_delivered));
            async move {
                // Simulate a producer appending while the sink is draining.
                if let Some(queue) = slot.lock().unwrap().take() {
                    queue.push(99);
                }
                delivered.lock().unwrap().push(drain.collect());
                Ok(())
            }
        });

        let collector = UnorderedCollector::new(manual(0), sink).unwrap();
        *collector_slot.lock().unwrap() = Some(Arc::clone(&collector.inner.queue));
        collector.append(1).await.unwrap();
        collector.append(2).await.unwrap();

        collector.flush().await.unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec![vec![1, 2]]);
        assert_eq!(collector.len(), 1);

        collector.flush().await.unwrap();
        assert_eq!(delivered.lock().unwrap()[1], vec![99]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_rejects_appends() {
        let delivered = Delivered::default();
        let collector = UnorderedCollector::new(manual(0), collecting_sink(Arc::clone(&delivered))).unwrap();
        collector.append(5).await.unwrap();

        collector.shutdown().await.unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec![vec![5]]);
        assert!(matches!(
            collector.append(6).await,
            Err(StashError::Disposed("UnorderedCollector"))
        ));
    }

    #[tokio::test]
    async fn test_timer_flushes_collector() {
        let delivered = Delivered::default();
        let config = CollectorConfig {
            limit: 0,
            flush_interval: Some(Duration::from_millis(20)),
        };
        let collector = UnorderedCollector::new(config, collecting_sink(Arc::clone(&delivered))).unwrap();

        collector.append(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*delivered.lock().unwrap(), vec![vec![3]]);
    }
}
