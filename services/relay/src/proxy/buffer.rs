//! Reusable buffers for the initial header read.
//!
//! Every connection draws exactly one buffer, reads the PROXY header into it
//! and gives it back as soon as the bytes after the header have been flushed
//! upstream. Buffers are returned on drop, so every exit path releases them.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::proxy_protocol::MAX_HEADER_LEN;

/// Room after a maximal header for application bytes in the same read.
const TRAILING_ROOM: usize = 16 * 1024;

/// Default buffer size: the largest legal header plus `TRAILING_ROOM`.
pub const DEFAULT_BUFFER_SIZE: usize = MAX_HEADER_LEN + TRAILING_ROOM;

/// Upper bound on idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Concurrent free list of fixed-size buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_idle(buffer_size, DEFAULT_MAX_IDLE)
    }

    /// Create a pool that keeps at most `max_idle` released buffers.
    pub fn with_max_idle(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size,
            max_idle,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Size of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer. It returns to the pool when the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        let data = reused.unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());

        self.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of released buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn release(&self, data: Box<[u8]>) {
        {
            let mut free = self
                .free
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if free.len() < self.max_idle {
                free.push(data);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A buffer owned by exactly one caller until dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}
