//! Fixed-size buffer pool bounding outstanding receive buffers.
//!
//! A bridge session leases one buffer per inbound read on its external side.
//! The lease travels with the overlay write request and comes back with the
//! write completion. When every buffer is out, [`BufferPool::acquire`] returns
//! `None` and the session stops reading: that is the backpressure signal.
//!
//! Buffers return to the pool when the [`PooledBuffer`] is dropped, so a lease
//! is released exactly once no matter which path (completion, discard, failed
//! send, teardown) ends its life.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::error;

/// Default size of each pooled buffer (32KB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of buffers per pool
pub const DEFAULT_POOL_SIZE: usize = 16;

struct PoolShared {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PoolShared {
    fn put_back(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() >= self.capacity || buf.len() != self.buffer_size {
            // More returns than leases: some code path released twice.
            error!(
                free = free.len(),
                capacity = self.capacity,
                "buffer returned to a full pool, discarding"
            );
            return;
        }
        free.push(buf);
    }
}

/// A pool of `capacity` preallocated buffers of `buffer_size` bytes each.
///
/// Cloning the pool yields another handle to the same free set.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool with the default geometry (16 x 32KB)
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_SIZE, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool holding `capacity` buffers of `buffer_size` bytes
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                capacity,
                free: Mutex::new(free),
            }),
        }
    }

    /// Lease a buffer. Never blocks; `None` means every buffer is in use.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let buf = self.shared.free.lock().pop()?;
        Some(PooledBuffer {
            buf: Some(buf),
            len: 0,
            pool: Arc::clone(&self.shared),
        })
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, buf: PooledBuffer) {
        drop(buf);
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Buffers currently sitting in the free set
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Buffers currently leased out
    pub fn outstanding(&self) -> usize {
        self.capacity() - self.available()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("buffer_size", &self.buffer_size())
            .field("available", &self.available())
            .finish()
    }
}

/// A leased buffer. Derefs to the filled part (`len` bytes); the whole
/// capacity is reachable through [`PooledBuffer::spare_mut`] for reads.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl PooledBuffer {
    /// Full capacity of the buffer, for filling from a read
    pub fn spare_mut(&mut self) -> &mut [u8] {
        match self.buf.as_deref_mut() {
            Some(buf) => buf,
            None => &mut [],
        }
    }

    /// Mark the first `len` bytes as filled. Clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.buf.as_deref() {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.buf.as_deref_mut() {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let pool = BufferPool::new();
        assert_eq!(pool.capacity(), 16);
        assert_eq!(pool.buffer_size(), 32 * 1024);
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_exhaustion_and_return() {
        let pool = BufferPool::with_capacity(2, 64);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        assert_eq!(pool.available(), 1);

        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_fill_and_view() {
        let pool = BufferPool::with_capacity(1, 8);
        let mut buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);

        buf.spare_mut()[..5].copy_from_slice(b"hello");
        buf.set_len(5);
        assert_eq!(&buf[..], b"hello");

        buf.set_len(100);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_lease_outlives_pool_handle() {
        let pool = BufferPool::with_capacity(1, 8);
        let buf = pool.acquire().unwrap();
        let other = pool.clone();
        drop(pool);

        drop(buf);
        assert_eq!(other.available(), 1);
    }

    #[test]
    fn test_pool_is_send_across_threads() {
        let pool = BufferPool::with_capacity(4, 16);
        let leases: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();

        std::thread::spawn(move || drop(leases)).join().unwrap();
        assert_eq!(pool.available(), 4);
    }
}
