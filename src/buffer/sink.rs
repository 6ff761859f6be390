//! Flush sinks
//!
//! A sink is the externally supplied consumer of a flushed batch. Every
//! buffering component takes exactly one sink at construction and never calls
//! it concurrently with itself, although producers keep running while it does.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

/// Consumer of flushed batches.
///
/// `B` is the batch shape the component hands over: a pooled [`Batch`] for
/// swap-based buffers, a lazy draining iterator for the live-drain variants.
///
/// [`Batch`]: crate::buffer::Batch
#[async_trait]
pub trait Sink<B>: Send + Sync + 'static
where
    B: Send + 'static,
{
    /// Consume one batch. Errors propagate to whoever triggered the flush.
    async fn consume(&self, batch: B) -> anyhow::Result<()>;
}

/// Sink backed by an async closure. Built with [`sink_fn`].
pub struct SinkFn<F, B> {
    f: F,
    _batch: PhantomData<fn(B)>,
}

/// Wrap an async closure as a [`Sink`].
///
/// ```rust,ignore
/// let sink = sink_fn(|batch: Batch<u64>| async move {
///     persist(&batch).await
/// });
/// ```
pub fn sink_fn<F, Fut, B>(f: F) -> SinkFn<F, B>
where
    F: Fn(B) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    B: Send + 'static,
{
    SinkFn {
        f,
        _batch: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, B> Sink<B> for SinkFn<F, B>
where
    F: Fn(B) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    B: Send + 'static,
{
    async fn consume(&self, batch: B) -> anyhow::Result<()> {
        (self.f)(batch).await
    }
}
