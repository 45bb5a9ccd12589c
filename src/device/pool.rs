//! Preallocated buffer pool
//!
//! A fixed slab of max-segment-sized buffers serving the datagram receive
//! and interface read paths. Acquisition blocks briefly when the pool is
//! dry and then gives up, turning memory pressure into packet drops
//! instead of unbounded growth.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Buffers preallocated per device
pub const POOL_BUFFERS: usize = 1024;

/// Largest possible UDP datagram
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// How long acquisition waits before dropping
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Fixed-size pool of reusable packet buffers
pub struct BufferPool {
    slots: async_channel::Receiver<Vec<u8>>,
    returns: async_channel::Sender<Vec<u8>>,
}

impl BufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        let (returns, slots) = async_channel::bounded(count);
        for _ in 0..count {
            returns
                .try_send(vec![0u8; size])
                .expect("pool channel sized to count");
        }
        Self { slots, returns }
    }

    /// Take a buffer, waiting up to the acquire timeout. Returns None
    /// when the pool stayed dry; the caller drops its packet.
    pub async fn acquire(&self) -> Option<PooledBuffer> {
        match tokio::time::timeout(ACQUIRE_TIMEOUT, self.slots.recv()).await {
            Ok(Ok(buf)) => Some(PooledBuffer {
                buf: Some(buf),
                returns: self.returns.clone(),
            }),
            _ => None,
        }
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.slots.len()
    }
}

/// A buffer on loan from the pool; returns itself when dropped
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    returns: async_channel::Sender<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            // The pool can never be over capacity, but if the device shut
            // the channel the buffer is simply freed.
            let _ = self.returns.try_send(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_return() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = BufferPool::new(1, 16);
        let held = pool.acquire().await.unwrap();

        let start = std::time::Instant::now();
        assert!(pool.acquire().await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(90));

        drop(held);
        assert!(pool.acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_buffer_is_writable() {
        let pool = BufferPool::new(1, 32);
        let mut buf = pool.acquire().await.unwrap();
        buf[0] = 0xAB;
        assert_eq!(buf[0], 0xAB);
    }
}
