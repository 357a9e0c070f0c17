//! Bounded pool of per-pair relay buffers.
//!
//! Each relay pair needs one buffer per direction. The pool hands out a
//! [`PoolLease`] holding both halves and caps the number of leases alive at
//! once, so peak buffer memory is `capacity * 2 * buffer_size` no matter
//! how many sockets are connected.
//!
//! Buffers are allocated lazily up to the capacity and recycled through a
//! lock-free bounded queue, so checkout and release are safe from any task.

use crate::error::{RelayError, Result};
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct PoolInner {
    idle: ArrayQueue<Box<[u8]>>,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
    capacity: usize,
    buffer_size: usize,
}

impl PoolInner {
    fn give_back(&self, buffer: Box<[u8]>) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        if self.idle.push(buffer).is_err() {
            // Only reachable if a foreign buffer is pushed; keep the count honest
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Fixed-size pool of relay buffers
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    /// Create a pool of `capacity` resources, each holding two
    /// `buffer_size` byte buffers.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: ArrayQueue::new(capacity),
                allocated: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                capacity,
                buffer_size,
            }),
        }
    }

    /// Check out one resource.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::PoolExhausted`] when every resource is in use.
    pub fn checkout(&self) -> Result<PoolLease> {
        let inner = &self.inner;

        let buffer = match inner.idle.pop() {
            Some(buffer) => buffer,
            None => {
                let reserved = inner
                    .allocated
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < inner.capacity).then_some(n + 1)
                    });
                if reserved.is_err() {
                    return Err(RelayError::PoolExhausted {
                        capacity: inner.capacity,
                    });
                }
                vec![0u8; inner.buffer_size * 2].into_boxed_slice()
            }
        };

        inner.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(PoolLease {
            buffer: Some(buffer),
            pool: Some(Arc::clone(inner)),
        })
    }

    /// Return a resource for reuse.
    ///
    /// Dropping the lease has the same effect; this makes the hand-back
    /// explicit at call sites.
    pub fn release(&self, lease: PoolLease) {
        drop(lease);
    }

    /// Allocate a resource that is not accounted to any pool
    #[must_use]
    pub fn unpooled(&self) -> PoolLease {
        PoolLease {
            buffer: Some(vec![0u8; self.inner.buffer_size * 2].into_boxed_slice()),
            pool: None,
        }
    }

    /// Fixed number of resources
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Per-direction buffer size
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of resources currently checked out
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Number of resources that can still be checked out
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.capacity.saturating_sub(self.in_use())
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.inner.capacity)
            .field("buffer_size", &self.inner.buffer_size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A resource checked out of a [`ResourcePool`].
///
/// Returned to its pool when dropped, so a relay task that is aborted never
/// leaks pool capacity.
pub struct PoolLease {
    buffer: Option<Box<[u8]>>,
    pool: Option<Arc<PoolInner>>,
}

impl PoolLease {
    /// Split into the two per-direction buffers
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let buffer = self.buffer.as_deref_mut().unwrap_or_default();
        let half = buffer.len() / 2;
        buffer.split_at_mut(half)
    }

    /// Whether this lease counts against a pool
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let (Some(buffer), Some(pool)) = (self.buffer.take(), self.pool.take()) {
            pool.give_back(buffer);
        }
    }
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("size", &self.buffer.as_ref().map_or(0, |b| b.len()))
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
