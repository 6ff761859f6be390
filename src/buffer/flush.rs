//! Flush coordination shared by the aggregation components
//!
//! [`FlushGate`] guarantees that a component never runs its sink concurrently
//! with itself. Explicit flushes wait their turn; capacity-triggered and
//! timer-triggered flushes never wait on a running sink. They leave a request
//! behind instead, and the flush in progress runs once more before releasing
//! the gate.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::types::{Result, StashError};

/// Follow-up flushes one holder of the gate runs before handing the
/// remaining work to the next trigger.
const MAX_CHAINED_FLUSHES: usize = 16;

/// Serializes flushes of one component.
#[derive(Default)]
pub(crate) struct FlushGate {
    lock: Mutex<()>,
    requested: AtomicBool,
}

impl FlushGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Flush, waiting for a flush in progress to finish first.
    pub(crate) async fn run<F, Fut>(&self, cancel: &CancellationToken, flush: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StashError::Cancelled),
            guard = self.lock.lock() => guard,
        };
        self.run_chain(guard, flush).await
    }

    /// Flush now if nobody else is, otherwise ask the current holder to
    /// flush again. Returns `false` when the flush was deferred.
    pub(crate) async fn run_or_defer<F, Fut>(&self, flush: F) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // Publish the request before trying the lock: a holder that has
        // already released the gate either sees it or we get the lock.
        self.requested.store(true, Ordering::SeqCst);
        match self.lock.try_lock() {
            Ok(guard) => self.run_chain(guard, flush).await.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    async fn run_chain<F, Fut>(
        &self,
        mut guard: tokio::sync::MutexGuard<'_, ()>,
        mut flush: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for _ in 0..MAX_CHAINED_FLUSHES {
            self.requested.store(false, Ordering::SeqCst);
            let result = flush().await;
            drop(guard);
            result?;

            if !self.requested.load(Ordering::SeqCst) {
                return Ok(());
            }
            // A request that arrived mid-flush. Whoever holds the gate now
            // clears the request and flushes on our behalf.
            guard = match self.lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(()),
            };
        }
        Ok(())
    }
}

/// Flush statistics for an aggregation component
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushStats {
    /// Sink invocations that succeeded
    pub flushes: u64,
    /// Items delivered by successful sink invocations. Drain-based
    /// components count items as the sink pulls them.
    pub items_flushed: u64,
    /// Sink invocations that failed
    pub failed_flushes: u64,
    /// Triggers that found a flush already running and left a request
    pub deferred_flushes: u64,
    /// Duration of the last sink invocation in milliseconds
    pub last_flush_ms: f64,
}

#[derive(Default)]
pub(crate) struct FlushCounters {
    flushes: AtomicU64,
    items_flushed: AtomicU64,
    failed_flushes: AtomicU64,
    deferred_flushes: AtomicU64,
    last_flush_us: AtomicU64,
}

impl FlushCounters {
    pub(crate) fn record(&self, started: Instant, outcome: &Result<()>) {
        self.last_flush_us
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        match outcome {
            Ok(()) => self.flushes.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed_flushes.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn add_items(&self, count: usize) {
        self.items_flushed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self) {
        self.deferred_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> FlushStats {
        FlushStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            deferred_flushes: self.deferred_flushes.load(Ordering::Relaxed),
            last_flush_ms: self.last_flush_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}
