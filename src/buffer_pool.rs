//! Pool of fixed-size send buffers.
//!
//! Outgoing chunks are assembled in pooled `Vec<u8>` buffers that return to
//! the pool once the writer task has flushed them. The configured size
//! counts the [`HEADER_SIZE`] frame header, which travels in its own slice,
//! so a full buffer always produces a frame of at most `buffer_size` bytes.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use object_pool::Pool;

use crate::protocol::{DEFAULT_BUFFER_SIZE, HEADER_SIZE};

/// Default number of buffers kept in the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Thread-safe pool of send buffers.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool with 64 buffers of 4096 bytes.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool with custom capacity and buffer size.
    ///
    /// Buffers smaller than a header plus one byte are rounded up.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(HEADER_SIZE + 16);
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Get an empty buffer from the pool.
    ///
    /// Falls back to a fresh allocation when the pool is exhausted.
    pub fn get(&self) -> PooledBuf {
        let size = self.buffer_size;
        let mut reusable = self.pool.pull_owned(|| Vec::with_capacity(size));
        // Buffers come back in whatever state they were dropped.
        reusable.clear();
        PooledBuf { inner: reusable }
    }

    /// Size of each buffer in bytes, header included.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled buffer that returns to its pool when dropped.
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
}

impl PooledBuf {
    /// Convert into `Bytes` without copying.
    ///
    /// The buffer goes back to the pool once every clone of the returned
    /// `Bytes` has been dropped.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}
