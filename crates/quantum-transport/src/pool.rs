//! Process-wide packet buffer pool.
//!
//! Amortizes per-packet allocation pressure on the hot send/receive path: a
//! single process-wide free list of scratch `BytesMut` buffers, shared by
//! every connection. Lifecycle is `acquire -> clear -> use -> release`;
//! buffers larger than [`MAX_POOLED_CAPACITY`] are dropped on release
//! instead of being retained, so one oversized datagram can't pin
//! unbounded memory in the pool.

use std::sync::Mutex;

use bytes::BytesMut;
use once_cell::sync::Lazy;

/// Buffers larger than this are not returned to the pool on release.
pub const MAX_POOLED_CAPACITY: usize = 2048;

/// Default number of buffers kept warm in the free list.
const DEFAULT_PREALLOC: usize = 64;

/// A single process-wide instance, lazily initialized on first use.
pub static PACKET_POOL: Lazy<PacketPool> = Lazy::new(|| PacketPool::new(DEFAULT_PREALLOC));

pub struct PacketPool {
    free: Mutex<Vec<BytesMut>>,
}

/// A buffer checked out of a [`PacketPool`]. Returned to the same pool it
/// came from automatically on drop.
pub struct PooledBuffer<'a> {
    pool: &'a PacketPool,
    buf: Option<BytesMut>,
}

impl PacketPool {
    pub fn new(prealloc: usize) -> Self {
        let free = (0..prealloc)
            .map(|_| BytesMut::with_capacity(MAX_POOLED_CAPACITY))
            .collect();
        PacketPool {
            free: Mutex::new(free),
        }
    }

    /// Acquire a cleared buffer, reusing a pooled one if available.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let mut buf = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_POOLED_CAPACITY));
        buf.clear();
        PooledBuffer { pool: self, buf: Some(buf) }
    }

    fn release(&self, buf: BytesMut) {
        if buf.capacity() <= MAX_POOLED_CAPACITY {
            self.free.lock().unwrap_or_else(|e| e.into_inner()).push(buf);
        }
        // Oversized buffers are simply dropped, shrinking the pool's
        // footprint back toward the common case.
    }

    /// Number of buffers currently idle in the pool.
    pub fn len(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::ops::Deref for PooledBuffer<'_> {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_cleared_buffer() {
        let pool = PacketPool::new(1);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn release_reuses_small_buffers() {
        let pool = PacketPool::new(0);
        assert_eq!(pool.len(), 0);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"data");
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn release_drops_oversized_buffers() {
        let pool = PacketPool::new(0);
        let oversized = BytesMut::with_capacity(MAX_POOLED_CAPACITY + 1);
        pool.release(oversized);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pooled_buffer_releases_to_its_own_pool_on_drop() {
        let pool = PacketPool::new(0);
        {
            let _buf = pool.acquire();
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn two_pools_keep_independent_free_lists() {
        let a = PacketPool::new(0);
        let b = PacketPool::new(0);
        drop(a.acquire());
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);
    }
}
