//! Pool of fixed-size chunks leased for reading spilled data back from disk.
//!
//! Each read from the spill file is capped at one chunk. Leased chunks that
//! end up being fed downstream are reclaimed through their reference count;
//! chunks from cancelled reads come back through `recycle` so the allocation
//! is reused.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// A pool of fixed-size read buffers.
#[derive(Debug)]
pub struct BufferPool {
    chunk_bytes: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
    leases: AtomicU64,
    recycles: AtomicU64,
}

impl BufferPool {
    /// Create a pool handing out chunks of `chunk_bytes`, keeping at most
    /// `capacity` free chunks around for reuse.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_bytes` is zero.
    pub fn new(chunk_bytes: usize, capacity: usize) -> Self {
        assert!(chunk_bytes > 0, "chunk_bytes must be positive");
        Self {
            chunk_bytes,
            capacity,
            free: Mutex::new(Vec::new()),
            leases: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Lease a chunk. The returned buffer is empty with at least
    /// `chunk_bytes` of capacity.
    pub fn lease(&self) -> BytesMut {
        self.leases.fetch_add(1, Ordering::Relaxed);
        if let Some(mut buf) = self.free.lock().pop() {
            buf.clear();
            return buf;
        }
        BytesMut::with_capacity(self.chunk_bytes)
    }

    /// Return a chunk whose contents were never handed out.
    pub fn recycle(&self, buf: BytesMut) {
        if buf.capacity() < self.chunk_bytes {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            self.recycles.fetch_add(1, Ordering::Relaxed);
            free.push(buf);
        }
    }

    /// Number of chunks currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Total leases handed out since construction.
    pub fn lease_count(&self) -> u64 {
        self.leases.load(Ordering::Relaxed)
    }

    /// Total chunks accepted back since construction.
    pub fn recycle_count(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_recycle_round_trip() {
        let pool = BufferPool::new(1024, 4);
        let buf = pool.lease();
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.lease_count(), 1);
        pool.recycle(buf);
        assert_eq!(pool.free_count(), 1);
        let again = pool.lease();
        assert!(again.is_empty());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn capacity_bounds_free_list() {
        let pool = BufferPool::new(16, 1);
        let a = pool.lease();
        let b = pool.lease();
        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn undersized_chunks_rejected() {
        let pool = BufferPool::new(1024, 4);
        pool.recycle(BytesMut::with_capacity(16));
        assert_eq!(pool.free_count(), 0);
    }
}
