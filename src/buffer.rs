//! Ordered queue of buffers awaiting reader or writer processing.
//!
//! The common case is a consumer that keeps up with the producer, so the
//! queue stores its first buffer inline and only spills additional buffers
//! into a `VecDeque`. Buffers are pushed at the tail and popped from the
//! head; in in-memory mode the reader pops, in in-file mode the writer pops
//! as it moves buffers to disk.

use std::collections::VecDeque;

use bytes::Bytes;

/// Maximum number of queued buffers (2^27 - 1).
pub const MAX_BUFFERS: u32 = (1 << 27) - 1;

/// Maximum total buffered bytes (2^32 - 1).
pub const MAX_MEMORY_BUFFERING: u32 = u32::MAX;

/// Queue of reference-counted buffers with a single-element fast path.
///
/// An empty buffer is the end-of-stream sentinel; once one is queued it is
/// always the tail and further pushes are ignored.
#[derive(Debug, Default)]
pub struct BufferQueue {
    first: Bytes,
    more: VecDeque<Bytes>,
    nbuffers: u32,
    bytes_buffered: u32,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn has_buffers(&self) -> bool {
        self.nbuffers > 0
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.nbuffers
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbuffers == 0
    }

    #[inline]
    pub fn bytes_buffered(&self) -> u32 {
        self.bytes_buffered
    }

    /// Append a buffer at the tail.
    ///
    /// # Panics
    ///
    /// Panics if the queue would exceed [`MAX_BUFFERS`] entries or
    /// [`MAX_MEMORY_BUFFERING`] total bytes.
    pub fn push_back(&mut self, buffer: Bytes) {
        if self.nbuffers > 0 && self.peek_back().is_empty() {
            // Stream already ended; the sentinel stays the tail.
            return;
        }
        assert!(
            self.bytes_buffered as u64 + buffer.len() as u64 <= u64::from(MAX_MEMORY_BUFFERING),
            "buffer queue byte limit exceeded"
        );
        assert!(self.nbuffers < MAX_BUFFERS, "buffer queue entry limit exceeded");
        let len = buffer.len() as u32;
        if self.nbuffers == 0 {
            self.first = buffer;
        } else {
            self.more.push_back(buffer);
        }
        self.nbuffers += 1;
        self.bytes_buffered += len;
    }

    /// Pop the head buffer. Returns `true` when the queue is now empty.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    pub fn pop_front(&mut self) -> bool {
        assert!(self.nbuffers > 0, "pop from empty buffer queue");
        debug_assert!(self.bytes_buffered as usize >= self.first.len());
        self.bytes_buffered -= self.first.len() as u32;
        self.nbuffers -= 1;
        match self.more.pop_front() {
            Some(next) => {
                self.first = next;
                false
            }
            None => {
                self.first = Bytes::new();
                debug_assert_eq!(self.nbuffers, 0);
                true
            }
        }
    }

    /// The head buffer. Only meaningful while `has_buffers()`.
    #[inline]
    pub fn peek_front(&self) -> &Bytes {
        debug_assert!(self.nbuffers > 0);
        &self.first
    }

    /// The tail buffer, used to detect the end-of-stream sentinel.
    pub fn peek_back(&self) -> &Bytes {
        debug_assert!(self.nbuffers > 0);
        if self.nbuffers <= 1 {
            &self.first
        } else {
            self.more.back().expect("overflow deque empty with nbuffers > 1")
        }
    }

    /// Iterate the queued buffers head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        let first = (self.nbuffers > 0).then_some(&self.first);
        first.into_iter().chain(self.more.iter())
    }

    pub fn clear(&mut self) {
        self.nbuffers = 0;
        self.bytes_buffered = 0;
        self.first = Bytes::new();
        if !self.more.is_empty() {
            self.more.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_single_buffer() {
        let mut q = BufferQueue::new();
        assert!(!q.has_buffers());
        q.push_back(Bytes::from_static(b"hello"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.bytes_buffered(), 5);
        assert_eq!(q.peek_front().as_ref(), b"hello");
        assert_eq!(q.peek_back().as_ref(), b"hello");
        assert!(q.pop_front());
        assert_eq!(q.bytes_buffered(), 0);
    }

    #[test]
    fn overflow_preserves_order() {
        let mut q = BufferQueue::new();
        q.push_back(Bytes::from_static(b"a"));
        q.push_back(Bytes::from_static(b"bb"));
        q.push_back(Bytes::from_static(b"ccc"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.bytes_buffered(), 6);
        let order: Vec<&[u8]> = q.iter().map(|b| b.as_ref()).collect();
        assert_eq!(order, vec![b"a".as_ref(), b"bb".as_ref(), b"ccc".as_ref()]);
        assert!(!q.pop_front());
        assert_eq!(q.peek_front().as_ref(), b"bb");
        assert!(!q.pop_front());
        assert!(q.pop_front());
        assert_eq!(q.bytes_buffered(), 0);
    }

    #[test]
    fn counters_stay_in_sync() {
        let mut q = BufferQueue::new();
        q.push_back(Bytes::from_static(b"xy"));
        q.push_back(Bytes::from_static(b"z"));
        let total: usize = q.iter().map(|b| b.len()).sum();
        assert_eq!(total as u32, q.bytes_buffered());
        q.pop_front();
        let total: usize = q.iter().map(|b| b.len()).sum();
        assert_eq!(total as u32, q.bytes_buffered());
    }

    #[test]
    fn pushes_after_sentinel_ignored() {
        let mut q = BufferQueue::new();
        q.push_back(Bytes::from_static(b"data"));
        q.push_back(Bytes::new());
        q.push_back(Bytes::from_static(b"late"));
        assert_eq!(q.len(), 2);
        assert!(q.peek_back().is_empty());
    }

    #[test]
    fn clear_resets_everything() {
        let mut q = BufferQueue::new();
        q.push_back(Bytes::from_static(b"a"));
        q.push_back(Bytes::from_static(b"b"));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.bytes_buffered(), 0);
        assert_eq!(q.iter().count(), 0);
    }

    #[test]
    fn empty_sentinel_counts_as_entry() {
        let mut q = BufferQueue::new();
        q.push_back(Bytes::new());
        assert!(q.has_buffers());
        assert_eq!(q.bytes_buffered(), 0);
        assert!(q.peek_front().is_empty());
    }
}
