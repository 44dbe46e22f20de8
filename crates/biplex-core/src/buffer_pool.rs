//! Pooled scratch buffers for protocol reads.
//!
//! Every inbound frame needs a payload buffer; reusing them through
//! `object-pool` keeps the reader loop from allocating per message.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::Pool;

const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;
const DEFAULT_POOL_CAPACITY: usize = 32;

/// A pool of reusable `Vec<u8>` read buffers.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_CAPACITY)
    }

    /// `capacity` buffers are kept around, each pre-allocated to
    /// `buffer_capacity` bytes. Larger frames grow the buffer as needed.
    pub fn with_capacity(capacity: usize, buffer_capacity: usize) -> Self {
        Self {
            pool: Arc::new(Pool::new(capacity, move || {
                Vec::with_capacity(buffer_capacity)
            })),
            buffer_capacity,
        }
    }

    /// Check out an empty buffer; it returns to the pool on drop.
    pub fn get(&self) -> PooledBuf {
        let mut buf = self
            .pool
            .pull_owned(|| Vec::with_capacity(self.buffer_capacity));
        // Buffers come back in whatever state they were dropped.
        buf.clear();
        PooledBuf { inner: buf }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
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
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_is_empty_even_after_reuse() {
        let pool = BufferPool::with_capacity(2, 64);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"leftovers");
        }
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn buffers_grow_past_their_preallocation() {
        let pool = BufferPool::with_capacity(1, 8);
        let mut buf = pool.get();
        buf.resize(1024, 0xAB);
        assert_eq!(buf.len(), 1024);
    }
}
