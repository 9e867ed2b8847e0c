use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Buffers that grew past this multiple of the base capacity are not retained.
const MAX_RETAINED_GROWTH: usize = 8;

/// A pool of reusable byte buffers, shared by all the peers of a node in order to avoid a fresh
/// allocation for every inbound and outbound message.
///
/// It's a cheaply clonable handle; all the clones refer to the same set of buffers.
#[derive(Clone)]
pub struct BufferPool(Arc<InnerPool>);

struct InnerPool {
    /// The idle buffers.
    idle: Mutex<Vec<BytesMut>>,
    /// The minimum capacity of every handed out buffer.
    capacity: usize,
    /// The maximum number of idle buffers to keep around.
    max_idle: usize,
}

impl BufferPool {
    /// Creates a pool handing out buffers of at least `capacity` bytes and keeping up to `max_idle`
    /// of them once they are returned.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self(Arc::new(InnerPool {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            capacity,
            max_idle,
        }))
    }

    /// Acquires an empty buffer with at least the pool's base capacity; it returns to the pool
    /// once the returned guard is dropped.
    pub fn get(&self) -> PooledBuffer {
        self.get_with_capacity(self.0.capacity)
    }

    /// Acquires an empty buffer with at least `capacity` bytes of capacity.
    pub fn get_with_capacity(&self, capacity: usize) -> PooledBuffer {
        let mut buf = self
            .0
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.0.capacity));
        buf.reserve(capacity);

        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Returns the base capacity of the pooled buffers.
    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Returns the number of idle buffers currently held by the pool.
    pub fn num_idle(&self) -> usize {
        self.0.idle.lock().len()
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.0.capacity.saturating_mul(MAX_RETAINED_GROWTH) {
            return;
        }
        buf.clear();

        let mut idle = self.0.idle.lock();
        if idle.len() < self.0.max_idle {
            idle.push(buf);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.0.capacity)
            .field("idle", &self.num_idle())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`]; it's returned to the pool when dropped, so it can't
/// be used after its release.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}
