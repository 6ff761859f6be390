//! Buffer Pool - Reusable batch containers
//!
//! Every flush cycle needs a fresh container to swap in for the live one.
//! Renting from a pool keeps the allocation of the previous cycle instead of
//! growing a new `Vec` from zero each time.
//!
//! A [`Batch`] is a rented container on its way to a sink. It goes back to
//! the pool when dropped, whether the sink succeeded, failed, or kept it
//! around for a while.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Containers handed out
    pub rented: u64,
    /// Rentals served from a pooled container
    pub reused: u64,
    /// Containers given back and kept
    pub returned: u64,
    /// Containers given back and dropped (pool full or oversized)
    pub discarded: u64,
    /// Containers currently idle in the pool
    pub pooled: usize,
}

impl PoolStats {
    /// Percentage of rentals that reused an existing allocation
    pub fn reuse_rate(&self) -> f64 {
        if self.rented == 0 {
            0.0
        } else {
            (self.reused as f64 / self.rented as f64) * 100.0
        }
    }
}

/// Pool of reusable `Vec<T>` containers.
///
/// Safe for concurrent rent/return. Share one pool between several buffers by
/// cloning the `Arc` into each component's builder.
pub struct BufferPool<T> {
    free: Mutex<Vec<Vec<T>>>,
    /// Idle containers kept at most
    max_pooled: usize,
    /// Capacity a fresh container starts with
    initial_capacity: usize,
    /// Containers that grew past this capacity are not pooled
    max_retained_capacity: usize,
    rented: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl<T> BufferPool<T> {
    /// Default number of idle containers kept
    pub const DEFAULT_MAX_POOLED: usize = 8;

    /// Create a pool whose fresh containers start with `initial_capacity`.
    pub fn new(initial_capacity: usize, max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            initial_capacity,
            max_retained_capacity: initial_capacity.saturating_mul(4).max(1024),
            rented: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Pool sized for batches of `limit` items (0 = unlimited).
    pub fn for_limit(limit: usize) -> Arc<Self> {
        let initial = if limit == 0 { 64 } else { limit };
        Arc::new(Self::new(initial, Self::DEFAULT_MAX_POOLED))
    }

    /// Rent an empty container.
    pub fn rent(&self) -> Vec<T> {
        self.rented.fetch_add(1, Ordering::Relaxed);
        let pooled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match pooled {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => Vec::with_capacity(self.initial_capacity),
        }
    }

    /// Rent a container wrapped as a [`Batch`] that returns itself on drop.
    pub fn rent_batch(self: &Arc<Self>) -> Batch<T> {
        Batch::pooled(self.rent(), Arc::clone(self))
    }

    /// Give a container back. It is cleared before being pooled.
    pub fn give_back(&self, mut buf: Vec<T>) {
        if buf.capacity() == 0 || buf.capacity() > self.max_retained_capacity {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buf);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            pooled: self.free.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

impl<T> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new(64, Self::DEFAULT_MAX_POOLED)
    }
}

/// A flushed batch, exclusively owned by the sink call it was handed to.
///
/// Dereferences to a slice. Dropping it clears the items and returns the
/// allocation to the pool it was rented from.
pub struct Batch<T> {
    items: Vec<T>,
    pool: Option<Arc<BufferPool<T>>>,
}

impl<T> Batch<T> {
    /// Wrap a rented container.
    pub(crate) fn pooled(items: Vec<T>, pool: Arc<BufferPool<T>>) -> Self {
        Self {
            items,
            pool: Some(pool),
        }
    }

    /// A batch that is not backed by any pool.
    pub fn detached(items: Vec<T>) -> Self {
        Self { items, pool: None }
    }

    /// Remove every item, keeping the allocation for the pool.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    /// Take the items out, giving up the allocation to the caller.
    pub fn into_vec(mut self) -> Vec<T> {
        self.pool = None;
        std::mem::take(&mut self.items)
    }

    pub(crate) fn push(&mut self, item: T) {
        self.items.push(item);
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> DerefMut for Batch<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.items
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> Drop for Batch<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.items));
        }
    }
}
