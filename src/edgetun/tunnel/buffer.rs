use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

/// Relay buffer size for TCP flows on the client side.
pub const TCP_BUFFER_SIZE: usize = 16 * 1024;
/// Large enough for any UDP datagram.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;
/// Relay buffer size on the edge side.
pub const EDGE_BUFFER_SIZE: usize = 32 * 1024;

const DEFAULT_MAX_IDLE: usize = 4096;

/// A free list of equally sized byte buffers.
///
/// Buffers are lent out as [`PooledBuf`] and go back to the free list when
/// the handle is dropped, so each buffer is returned exactly once. A buffer
/// moved into a queue travels with its handle.
pub struct BufferPool {
    size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .finish()
    }
}

impl BufferPool {
    pub fn new(size: usize) -> Arc<Self> {
        Self::with_max_idle(size, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            size: size.max(1),
            max_idle,
            free: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently parked in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Drops every parked buffer; buffers returned afterwards are freed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.free.lock().clear();
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.buf.len()).finish()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}
