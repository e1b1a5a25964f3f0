//! Process-wide piece buffer pool.
//!
//! In-flight piece buffers are the dominant allocation of a busy session.
//! The pool recycles them across torrents; it is injected into sessions
//! rather than being a global.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

const POOL_CAPACITY: usize = 64;

/// A fixed-capacity pool of piece-sized buffers.
///
/// `get` falls back to a fresh allocation when the pool is empty and
/// `put` drops the buffer when it is full, so the pool never blocks.
pub struct PiecePool {
    buffers: ArrayQueue<BytesMut>,
}

impl PiecePool {
    pub fn new() -> Self {
        Self {
            buffers: ArrayQueue::new(POOL_CAPACITY),
        }
    }

    /// Takes a zeroed buffer of exactly `len` bytes.
    pub fn get(&self, len: usize) -> BytesMut {
        let mut buf = self.buffers.pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Returns a buffer for reuse.
    pub fn put(&self, buf: BytesMut) {
        let _ = self.buffers.push(buf);
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for PiecePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_resizes_to_requested_length() {
        let pool = PiecePool::new();
        let buf = pool.get(1024);
        assert_eq!(buf.len(), 1024);
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let again = pool.get(16);
        assert_eq!(again.len(), 16);
        assert!(again.iter().all(|b| *b == 0));
        assert_eq!(pool.available(), 0);
    }
}
