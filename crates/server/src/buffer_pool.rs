//! Reusable chunk buffers.
//!
//! Buffers are loaned out as [`PooledBuffer`] guards and go back to the
//! free list when the guard drops. A chunk is handed to the destination by
//! freezing the filled region; once the destination drops it the guard can
//! reclaim the same allocation.

use bytes::{Bytes, BytesMut};
use drivex_core::SizeClass;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct FreeLists {
    lists: HashMap<SizeClass, Vec<BytesMut>>,
    idle: usize,
}

struct PoolInner {
    capacity: usize,
    free: Mutex<FreeLists>,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    loaned: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, FreeLists> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, class: SizeClass, mut buf: BytesMut) {
        self.loaned.fetch_sub(1, Ordering::Relaxed);
        buf.clear();
        // Reclaims the original allocation if no frozen chunk still refers to it,
        // otherwise allocates a fresh one.
        buf.reserve(class.capacity() as usize);

        let mut free = self.lock();
        if free.idle >= self.capacity {
            drop(free);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        free.lists.entry(class).or_default().push(buf);
        free.idle += 1;
        crate::metrics::BUFFER_POOL_IDLE.set(free.idle as i64);
    }
}

/// Occupancy figures for operators.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BufferPoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub idle_by_class: HashMap<SizeClass, usize>,
    pub loaned: u64,
    pub allocated: u64,
    pub reused: u64,
    pub discarded: u64,
}

/// Pool of chunk buffers in several size classes.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool that keeps at most `capacity` idle buffers across classes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(FreeLists::default()),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                loaned: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow a buffer of `class`, reusing an idle one if available.
    pub fn acquire(&self, class: SizeClass) -> PooledBuffer {
        let reused = {
            let mut free = self.inner.lock();
            let buf = free.lists.get_mut(&class).and_then(Vec::pop);
            if buf.is_some() {
                free.idle -= 1;
                crate::metrics::BUFFER_POOL_IDLE.set(free.idle as i64);
            }
            buf
        };

        let buf = match reused {
            Some(buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(class.capacity() as usize)
            }
        };
        self.inner.loaned.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            buf: Some(buf),
            class,
            pool: self.inner.clone(),
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let free = self.inner.lock();
        BufferPoolStats {
            capacity: self.inner.capacity,
            idle: free.idle,
            idle_by_class: free
                .lists
                .iter()
                .map(|(class, list)| (*class, list.len()))
                .collect(),
            loaned: self.inner.loaned.load(Ordering::Relaxed),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned on drop.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    class: SizeClass,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, BytesMut::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Hand the filled region out as an immutable chunk, leaving the buffer empty.
    pub fn freeze_chunk(&mut self) -> Bytes {
        self.buf
            .as_mut()
            .map(|buf| buf.split().freeze())
            .unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(self.class, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_then_reuses() {
        let pool = BufferPool::new(4);
        drop(pool.acquire(SizeClass::Small));
        assert_eq!(pool.stats().idle, 1);

        let buf = pool.acquire(SizeClass::Small);
        assert!(buf.is_empty());
        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.loaned, 1);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_classes_are_kept_apart() {
        let pool = BufferPool::new(4);
        drop(pool.acquire(SizeClass::Large));
        let buf = pool.acquire(SizeClass::Small);
        assert_eq!(buf.class(), SizeClass::Small);
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.stats().idle_by_class.get(&SizeClass::Large), Some(&1));
    }

    #[test]
    fn test_excess_buffers_are_discarded() {
        let pool = BufferPool::new(2);
        let held: Vec<_> = (0..3).map(|_| pool.acquire(SizeClass::Small)).collect();
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.loaned, 0);
    }

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = BufferPool::new(2);
        let mut buf = pool.acquire(SizeClass::Small);
        buf.extend_from_slice(b"stale");
        drop(buf);
        assert!(pool.acquire(SizeClass::Small).is_empty());
    }

    #[test]
    fn test_frozen_chunk_is_not_overwritten_by_next_borrower() {
        let pool = BufferPool::new(2);
        let mut buf = pool.acquire(SizeClass::Small);
        buf.extend_from_slice(b"first chunk");
        let chunk = buf.freeze_chunk();
        assert!(buf.is_empty());
        drop(buf);

        let mut next = pool.acquire(SizeClass::Small);
        next.extend_from_slice(b"second data");
        assert_eq!(&chunk[..], b"first chunk");
    }
}
