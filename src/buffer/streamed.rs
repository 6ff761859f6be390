//! Streamed Buffer - Live-drain accumulation over a channel
//!
//! Producers enqueue into a tokio mpsc channel, bounded or unbounded. A flush
//! takes the receiving end and hands the sink a [`StreamedDrain`] that pulls
//! items off the channel one at a time until it is empty. Nothing is swapped
//! and no container is rented.
//!
//! Known race: the drain reads the live channel, so items enqueued while the
//! sink is running may or may not be consumed by that same flush. Each item
//! is still delivered at most once, but batch boundaries are timing
//! dependent. Use [`BatchBuffer`](super::BatchBuffer) when callers need a
//! point-in-time batch.
//!
//! Items a sink leaves undrained stay queued for the next flush.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::flush::{FlushCounters, FlushStats};
use super::sink::Sink;
use super::timer::{weak_tick, PeriodicTimer};
use super::StreamedBufferConfig;
use crate::types::{Result, StashError};

const NAME: &str = "StreamedBuffer";

enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
        }
    }
}

enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<T> {
        match self {
            Self::Bounded(rx) => rx.try_recv().ok(),
            Self::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Bounded(rx) => rx.close(),
            Self::Unbounded(rx) => rx.close(),
        }
    }
}

fn channel<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
    }
}

/// State shared between the buffer and the drains it hands out
#[derive(Default)]
struct QueueShared {
    queued: AtomicUsize,
    counters: FlushCounters,
}

/// Lazy sequence handed to a [`StreamedBuffer`] sink.
///
/// Holds exclusive access to the receiving end of the queue until dropped.
pub struct StreamedDrain<T> {
    first: Option<T>,
    rx: OwnedMutexGuard<QueueReceiver<T>>,
    shared: Arc<QueueShared>,
}

impl<T> Iterator for StreamedDrain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.first.take().or_else(|| self.rx.try_recv());
        if item.is_some() {
            self.shared.queued.fetch_sub(1, Ordering::Relaxed);
            self.shared.counters.add_items(1);
        }
        item
    }
}

/// Channel-backed buffer that drains live while the sink consumes.
pub struct StreamedBuffer<T: Send + 'static> {
    inner: Arc<StreamedInner<T>>,
    timer: Option<PeriodicTimer>,
}

struct StreamedInner<T: Send + 'static> {
    /// `None` once the buffer has been shut down
    sender: RwLock<Option<QueueSender<T>>>,
    receiver: Arc<Mutex<QueueReceiver<T>>>,
    sink: Box<dyn Sink<StreamedDrain<T>>>,
    shared: Arc<QueueShared>,
}

impl<T: Send + 'static> StreamedBuffer<T> {
    /// Create a buffer. `config.capacity == 0` selects an unbounded queue.
    pub fn new<S>(config: StreamedBufferConfig, sink: S) -> Result<Self>
    where
        S: Sink<StreamedDrain<T>>,
    {
        let config = config.normalized();
        let (tx, rx) = channel(config.capacity);
        let inner = Arc::new(StreamedInner {
            sender: RwLock::new(Some(tx)),
            receiver: Arc::new(Mutex::new(rx)),
            sink: Box::new(sink),
            shared: Arc::new(QueueShared::default()),
        });

        let timer = match config.flush_interval {
            Some(interval) => {
                let tick = weak_tick(&inner, |inner: Arc<StreamedInner<T>>| async move {
                    if let Err(e) = inner.flush_pending().await {
                        error!(error = %e, "Timer-triggered StreamedBuffer flush failed");
                    }
                });
                let timer = PeriodicTimer::new("streamed-buffer", interval, tick);
                timer.start()?;
                Some(timer)
            }
            None => None,
        };

        info!(
            capacity = config.capacity,
            interval_ms = config.flush_interval.map(|i| i.as_millis() as u64),
            "StreamedBuffer initialized"
        );

        Ok(Self { inner, timer })
    }

    /// Enqueue an item. Only suspends when the bounded queue is full.
    pub async fn put(&self, item: T) -> Result<()> {
        self.put_cancellable(item, &CancellationToken::new()).await
    }

    /// Enqueue an item. A full queue is flushed first, then the call waits
    /// for room. If `cancel` fires during that wait the item is dropped and
    /// `StashError::Cancelled` is returned.
    pub async fn put_cancellable(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        let sender = self
            .inner
            .sender
            .read()?
            .clone()
            .ok_or(StashError::Disposed(NAME))?;

        self.inner.shared.queued.fetch_add(1, Ordering::Relaxed);
        let sent = match sender {
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|_| StashError::Disposed(NAME)),
            QueueSender::Bounded(tx) => match tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Closed(_)) => Err(StashError::Disposed(NAME)),
                Err(TrySendError::Full(item)) => {
                    debug!("StreamedBuffer queue full, flushing before enqueue");
                    match self.inner.flush_queued(cancel).await {
                        Ok(()) => tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(StashError::Cancelled),
                            sent = tx.send(item) => sent.map_err(|_| StashError::Disposed(NAME)),
                        },
                        Err(e) => Err(e),
                    }
                }
            },
        };

        if sent.is_err() {
            self.inner.shared.queued.fetch_sub(1, Ordering::Relaxed);
        }
        sent
    }

    /// Wait until at least one item is queued, then drain into the sink.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush(&CancellationToken::new()).await
    }

    /// Like [`flush`](Self::flush), aborting with `StashError::Cancelled`
    /// when `cancel` fires before an item arrives. No item is dequeued then.
    pub async fn flush_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.flush(cancel).await
    }

    /// Flush only if items are already queued and no flush is running.
    pub async fn flush_pending(&self) -> Result<()> {
        self.inner.flush_pending().await
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.inner.shared.queued.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and flush whatever is left in it.
    ///
    /// Later `put` calls fail with `StashError::Disposed`.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        if self.inner.sender.write()?.take().is_none() {
            return Ok(());
        }

        let mut rx = Arc::clone(&self.inner.receiver).lock_owned().await;
        rx.close();
        info!(pending = self.len(), "StreamedBuffer shutting down");

        match rx.try_recv() {
            Some(first) => self.inner.deliver(first, rx).await,
            None => Ok(()),
        }
    }

    /// Flush timer, for changing the period at runtime
    pub fn timer(&self) -> Option<&PeriodicTimer> {
        self.timer.as_ref()
    }

    /// Get flush statistics
    pub fn stats(&self) -> FlushStats {
        self.inner.shared.counters.snapshot()
    }
}

impl<T: Send + 'static> StreamedInner<T> {
    async fn lock_receiver(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedMutexGuard<QueueReceiver<T>>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StashError::Cancelled),
            rx = Arc::clone(&self.receiver).lock_owned() => Ok(rx),
        }
    }

    async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.lock_receiver(cancel).await?;

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StashError::Cancelled),
            first = rx.recv() => first,
        };

        match first {
            Some(first) => self.deliver(first, rx).await,
            // Closed and empty
            None => Ok(()),
        }
    }

    /// Wait for a running flush, then drain whatever is queued. Never waits
    /// for new items, since the caller may be the only producer.
    async fn flush_queued(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.lock_receiver(cancel).await?;
        match rx.try_recv() {
            Some(first) => self.deliver(first, rx).await,
            None => Ok(()),
        }
    }

    async fn flush_pending(&self) -> Result<()> {
        let mut rx = match Arc::clone(&self.receiver).try_lock_owned() {
            Ok(rx) => rx,
            Err(_) => {
                // The running flush is draining live and will see our items.
                self.shared.counters.record_deferred();
                return Ok(());
            }
        };

        match rx.try_recv() {
            Some(first) => self.deliver(first, rx).await,
            None => Ok(()),
        }
    }

    async fn deliver(&self, first: T, rx: OwnedMutexGuard<QueueReceiver<T>>) -> Result<()> {
        let drain = StreamedDrain {
            first: Some(first),
            rx,
            shared: Arc::clone(&self.shared),
        };

        let started = Instant::now();
        let outcome = self.sink.consume(drain).await.map_err(StashError::from);
        self.shared.counters.record(started, &outcome);
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            remaining = self.shared.queued.load(Ordering::Relaxed),
            ok = outcome.is_ok(),
            "StreamedBuffer flushed"
        );
        outcome
    }
}
