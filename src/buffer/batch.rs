//! Batch Buffer - Swap-based accumulation
//!
//! Producers append to a live `Vec` under a short-held lock. A flush swaps
//! that `Vec` for an empty one rented from the [`BufferPool`] and hands the
//! swapped-out container to the sink after the lock is released, so a slow
//! sink never blocks producers and producers never see a half-flushed buffer.
//!
//! ## Guarantees
//!
//! - Every item lands in exactly one batch, in the order it was appended
//! - The sink is never invoked concurrently with itself
//! - A failed batch is not retried (at-most-once delivery); its container
//!   still goes back to the pool

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::flush::{FlushCounters, FlushGate, FlushStats};
use super::pool::{Batch, BufferPool};
use super::sink::Sink;
use super::timer::{weak_tick, PeriodicTimer};
use super::BatchBufferConfig;
use crate::types::{Result, StashError};

const NAME: &str = "BatchBuffer";

/// Swap-based batch buffer.
///
/// ```rust,ignore
/// let buffer = BatchBuffer::new(
///     BatchBufferConfig { limit: 500, flush_interval: Some(Duration::from_secs(1)) },
///     sink_fn(|batch: Batch<Event>| async move { store.insert_many(&batch).await }),
/// )?;
/// buffer.put(event).await?;
/// ```
pub struct BatchBuffer<T: Send + 'static> {
    inner: Arc<BatchInner<T>>,
    timer: Option<PeriodicTimer>,
}

struct BatchInner<T: Send + 'static> {
    /// `None` once the buffer has been shut down
    live: Mutex<Option<Vec<T>>>,
    limit: usize,
    pool: Arc<BufferPool<T>>,
    sink: Box<dyn Sink<Batch<T>>>,
    gate: FlushGate,
    counters: FlushCounters,
}

impl<T: Send + 'static> BatchBuffer<T> {
    /// Create a buffer with its own pool.
    ///
    /// Starts the flush timer when `config.flush_interval` is set, which
    /// requires a tokio runtime.
    pub fn new<S>(config: BatchBufferConfig, sink: S) -> Result<Self>
    where
        S: Sink<Batch<T>>,
    {
        let pool = BufferPool::for_limit(config.limit);
        Self::with_pool(config, pool, sink)
    }

    /// Create a buffer renting its containers from a shared pool.
    pub fn with_pool<S>(config: BatchBufferConfig, pool: Arc<BufferPool<T>>, sink: S) -> Result<Self>
    where
        S: Sink<Batch<T>>,
    {
        let config = config.normalized();
        let inner = Arc::new(BatchInner {
            live: Mutex::new(Some(pool.rent())),
            limit: config.limit,
            pool,
            sink: Box::new(sink),
            gate: FlushGate::new(),
            counters: FlushCounters::default(),
        });

        let timer = match config.flush_interval {
            Some(interval) => {
                let tick = weak_tick(&inner, |inner: Arc<BatchInner<T>>| async move {
                    inner.flush_from_timer().await
                });
                let timer = PeriodicTimer::new("batch-buffer", interval, tick);
                timer.start()?;
                Some(timer)
            }
            None => None,
        };

        info!(
            limit = config.limit,
            interval_ms = config.flush_interval.map(|i| i.as_millis() as u64),
            "BatchBuffer initialized"
        );

        Ok(Self { inner, timer })
    }

    /// Append an item. Runs a flush before returning once the limit is reached.
    ///
    /// Sink errors from that flush are returned here. The item itself was
    /// accepted either way.
    pub async fn put(&self, item: T) -> Result<()> {
        let reached = {
            let mut live = self.inner.live.lock()?;
            let live = live.as_mut().ok_or(StashError::Disposed(NAME))?;
            live.push(item);
            self.inner.limit > 0 && live.len() >= self.inner.limit
        };

        if reached {
            self.inner.flush_on_capacity().await?;
        }
        Ok(())
    }

    /// Flush everything buffered so far, waiting for a flush in progress.
    pub async fn flush(&self) -> Result<()> {
        self.flush_cancellable(&CancellationToken::new()).await
    }

    /// Flush, giving up with `StashError::Cancelled` if `cancel` fires while
    /// waiting for a flush in progress. Nothing is swapped out in that case.
    pub async fn flush_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &*self.inner;
        inner.gate.run(cancel, move || inner.flush_once()).await
    }

    /// Remove and return the item at `index`. Negative indices count from the
    /// end (`-1` is the most recent item). Out of range yields `None`.
    pub fn try_take(&self, index: isize) -> Result<Option<T>> {
        let mut live = self.inner.live.lock()?;
        let live = live.as_mut().ok_or(StashError::Disposed(NAME))?;

        let len = live.len() as isize;
        let position = if index < 0 { len + index } else { index };
        if position < 0 || position >= len {
            return Ok(None);
        }
        Ok(Some(live.remove(position as usize)))
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.inner
            .live
            .lock()
            .map(|live| live.as_ref().map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every buffered item without calling the sink.
    pub fn drain_all(&self) -> Result<Vec<T>> {
        let mut live = self.inner.live.lock()?;
        let live = live.as_mut().ok_or(StashError::Disposed(NAME))?;
        Ok(std::mem::take(live))
    }

    /// Stop the timer, detach the live buffer and flush what it held.
    ///
    /// Later `put` calls fail with `StashError::Disposed`; `flush` becomes a
    /// no-op. Calling `shutdown` twice is harmless.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(timer) = &self.timer {
            timer.stop();
        }

        let pending = self.inner.live.lock()?.take();
        let Some(pending) = pending else {
            return Ok(());
        };
        info!(pending = pending.len(), "BatchBuffer shutting down");

        let inner = &*self.inner;
        let mut pending = Some(pending);
        inner
            .gate
            .run(&CancellationToken::new(), move || inner.deliver(pending.take()))
            .await
    }

    /// Flush timer, for changing the period at runtime
    pub fn timer(&self) -> Option<&PeriodicTimer> {
        self.timer.as_ref()
    }

    /// Pool the batch containers are rented from
    pub fn pool(&self) -> &Arc<BufferPool<T>> {
        &self.inner.pool
    }

    /// Get flush statistics
    pub fn stats(&self) -> FlushStats {
        self.inner.counters.snapshot()
    }
}

impl<T: Send + 'static> BatchInner<T> {
    async fn flush_once(&self) -> Result<()> {
        let swapped = self.swap()?;
        self.deliver(swapped).await
    }

    /// Swap the live buffer for a rented one. `None` when there is nothing
    /// to flush or the buffer was shut down.
    fn swap(&self) -> Result<Option<Vec<T>>> {
        let mut fresh = Some(self.pool.rent());
        let swapped = {
            let mut live = self.live.lock()?;
            match live.as_mut() {
                Some(live) if !live.is_empty() => {
                    fresh.take().map(|fresh| std::mem::replace(live, fresh))
                }
                _ => None,
            }
        };

        if let Some(unused) = fresh {
            self.pool.give_back(unused);
        }
        Ok(swapped)
    }

    async fn deliver(&self, items: Option<Vec<T>>) -> Result<()> {
        let items = match items {
            Some(items) if !items.is_empty() => items,
            Some(empty) => {
                self.pool.give_back(empty);
                return Ok(());
            }
            None => return Ok(()),
        };

        let count = items.len();
        let batch = Batch::pooled(items, Arc::clone(&self.pool));
        let started = Instant::now();
        let outcome = self.sink.consume(batch).await.map_err(StashError::from);

        self.counters.record(started, &outcome);
        if outcome.is_ok() {
            self.counters.add_items(count);
        }
        debug!(
            items = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "BatchBuffer flushed"
        );
        outcome
    }

    async fn flush_on_capacity(&self) -> Result<()> {
        if !self.gate.run_or_defer(move || self.flush_once()).await? {
            self.counters.record_deferred();
        }
        Ok(())
    }

    async fn flush_from_timer(&self) {
        match self.gate.run_or_defer(move || self.flush_once()).await {
            Ok(true) => {}
            Ok(false) => self.counters.record_deferred(),
            Err(e) => error!(error = %e, "Timer-triggered BatchBuffer flush failed"),
        }
    }
}

impl<T: Send + 'static> Drop for BatchBuffer<T> {
    fn drop(&mut self) {
        let remaining = self.len();
        if remaining > 0 {
            warn!(remaining, "BatchBuffer dropped with unflushed items, call shutdown() to keep them");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::sink_fn;
    use std::time::Duration;

    type Delivered = Arc<Mutex<Vec<Vec<u32>>>>;

    fn collecting_sink(delivered: Delivered) -> impl Sink<Batch<u32>> {
        sink_fn(move |batch: Batch<u32>| {
            let delivered = Arc::clone(&delivered);
            async move {
                delivered.lock().unwrap().push(batch.to_vec());
                Ok(())
            }
        })
    }

    fn manual(limit: usize) -> BatchBufferConfig {
        BatchBufferConfig {
            limit,
            flush_interval: None,
        }
    }

    #[tokio::test]
    async fn test_limit_triggers_flush_before_put_returns() {
        let delivered = Delivered::default();
        let buffer = BatchBuffer::new(manual(3), collecting_sink(Arc::clone(&delivered))).unwrap();

        for i in 1..=5 {
            buffer.put(i).await.unwrap();
            if i == 3 {
                assert_eq!(*delivered.lock().unwrap(), vec![vec![1, 2, 3]]);
            }
        }
        assert_eq!(buffer.len(), 2);

        buffer.flush().await.unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(buffer.stats().flushes, 2);
        assert_eq!(buffer.stats().items_flushed, 5);
    }

    #[tokio::test]
    async fn test_empty_flush_skips_sink() {
        let delivered = Delivered::default();
        let buffer = BatchBuffer::new(manual(0), collecting_sink(Arc::clone(&delivered))).unwrap();

        buffer.flush().await.unwrap();
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(buffer.stats().flushes, 0);
    }

    #[tokio::test]
    async fn test_try_take_supports_negative_index() {
        let buffer = BatchBuffer::new(manual(0), collecting_sink(Delivered::default())).unwrap();
        for i in [10, 20, 30, 40] {
            buffer.put(i).await.unwrap();
        }

        assert_eq!(buffer.try_take(-1).unwrap(), Some(40));
        assert_eq!(buffer.try_take(0).unwrap(), Some(10));
        assert_eq!(buffer.try_take(5).unwrap(), None);
        assert_eq!(buffer.try_take(-3).unwrap(), None);
        assert_eq!(buffer.drain_all().unwrap(), vec![20, 30]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_retried() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let sink = sink_fn(move |_batch: Batch<u32>| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Err::<(), _>(anyhow::anyhow!("backend offline"))
            }
        });

        let buffer = BatchBuffer::new(manual(0), sink).unwrap();
        buffer.put(1).await.unwrap();

        let err = buffer.flush().await.unwrap_err();
        assert!(err.is_sink());
        assert_eq!(buffer.stats().failed_flushes, 1);
        assert_eq!(buffer.stats().items_flushed, 0);
        assert_eq!(buffer.pool().stats().returned, 1);

        buffer.flush().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_flush_leaves_items_buffered() {
        let delivered = Delivered::default();
        let sink_delivered = Arc::clone(&delivered);
        let sink = sink_fn(move |batch: Batch<u32>| {
            let delivered = Arc::clone(&sink_delivered);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                delivered.lock().unwrap().push(batch.to_vec());
                Ok(())
            }
        });
        let buffer = Arc::new(BatchBuffer::new(manual(0), sink).unwrap());
        buffer.put(1).await.unwrap();

        let slow = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.put(2).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = buffer.flush_cancellable(&cancel).await;
        assert!(matches!(result, Err(StashError::Cancelled)));
        assert_eq!(buffer.len(), 1);

        slow.await.unwrap().unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec![vec![1]]);
        buffer.flush().await.unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_rejects_puts() {
        let delivered = Delivered::default();
        let buffer = BatchBuffer::new(manual(0), collecting_sink(Arc::clone(&delivered))).unwrap();
        buffer.put(7).await.unwrap();
        buffer.put(8).await.unwrap();

        buffer.shutdown().await.unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec![vec![7, 8]]);

        assert!(matches!(buffer.put(9).await, Err(StashError::Disposed("BatchBuffer"))));
        buffer.flush().await.unwrap();
        buffer.shutdown().await.unwrap();
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timer_flushes_buffer() {
        let delivered = Delivered::default();
        let config = BatchBufferConfig {
            limit: 0,
            flush_interval: Some(Duration::from_millis(20)),
        };
        let buffer = BatchBuffer::new(config, collecting_sink(Arc::clone(&delivered))).unwrap();
        assert!(buffer.timer().is_some_and(|t| t.is_running()));

        buffer.put(1).await.unwrap();
        buffer.put(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(*delivered.lock().unwrap(), vec![vec![1, 2]]);
        buffer.shutdown().await.unwrap();
    }

    #[test]
    fn test_timer_requires_runtime() {
        let config = BatchBufferConfig {
            limit: 10,
            flush_interval: Some(Duration::from_secs(1)),
        };
        let result = BatchBuffer::new(config, collecting_sink(Delivered::default()));
        assert!(matches!(result, Err(StashError::NoRuntime)));
    }
}
