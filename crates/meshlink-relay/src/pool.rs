//! Reusable payload buffers for the relay receive path.

use crossbeam_queue::ArrayQueue;

/// Bounded lock-free pool of byte buffers.
///
/// Buffers returned past `max_buffers` are dropped instead of retained.
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    default_capacity: usize,
}

impl BufferPool {
    /// Create a pool keeping at most `max_buffers` idle buffers
    #[must_use]
    pub fn new(default_capacity: usize, max_buffers: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(max_buffers.max(1)),
            default_capacity,
        }
    }

    /// Take a buffer resized to exactly `len` zeroed bytes
    pub fn get(&self, len: usize) -> Vec<u8> {
        let mut buf = self
            .buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.default_capacity.max(len)));
        buf.resize(len, 0);
        buf
    }

    /// Hand a buffer back
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let _ = self.buffers.push(buf);
    }

    /// Idle buffers currently held
    #[must_use]
    pub fn idle(&self) -> usize {
        self.buffers.len()
    }
}
