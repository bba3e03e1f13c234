//! Bounded pool of reusable byte buffers for the feed hot path.
//!
//! Buffers are handed out as [`PooledBuffer`] guards that clear themselves
//! and return to the pool on drop. The pool never holds more than
//! `max_buffers` idle buffers; anything released beyond that is freed.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::video::format::Resolution;

pub type SharedBufferPool = Arc<BufferPool>;

pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
    outstanding: AtomicUsize,
    expansions: AtomicU64,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(max_buffers)),
            buffer_size,
            max_buffers,
            outstanding: AtomicUsize::new(0),
            expansions: AtomicU64::new(0),
        })
    }

    /// Size the pool from the resolution tier. Fixed for the pool's lifetime.
    pub fn for_resolution(resolution: Resolution) -> Arc<Self> {
        let tier = resolution.tier();
        Self::new(tier.pool_buffer_size(), tier.pool_max_buffers())
    }

    /// Hand out an empty buffer with capacity for at least `min_size` bytes.
    pub fn acquire(self: &Arc<Self>, min_size: usize) -> PooledBuffer {
        let candidate = self.idle.lock().pop();

        let mut vec = match candidate {
            Some(v) if v.capacity() >= min_size => v,
            _ => {
                let capacity = min_size.max(self.buffer_size);
                let expansions = self.expansions.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "BufferPool: allocating {} byte buffer (requested {}, expansions {})",
                    capacity, min_size, expansions
                );
                Vec::with_capacity(capacity)
            }
        };

        vec.clear();
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            vec,
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer early. Dropping the guard does the same.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    fn give_back(&self, mut vec: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        vec.clear();

        let mut idle = self.idle.lock();
        if idle.len() < self.max_buffers {
            idle.push(vec);
        }
        // else: drop automatically
    }

    /// Free every idle buffer. Buffers currently handed out are unaffected.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            max_buffers: self.max_buffers,
            buffer_size: self.buffer_size,
            outstanding: self.outstanding.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub max_buffers: usize,
    pub buffer_size: usize,
    pub outstanding: usize,
    pub expansions: u64,
}

pub struct PooledBuffer {
    vec: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.vec
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vec
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let vec = std::mem::take(&mut self.vec);
        self.pool.give_back(vec);
    }
}
