//! Shared buffer pool
//!
//! The pool is the only resource shared between connections. Storage is
//! cached per power-of-two size class so steady-state reads and writes
//! do not allocate.

use crate::buffer::Buffer;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Smallest size class handed out
const MIN_CLASS: usize = 64;

/// Cached storage kept per size class
const DEFAULT_MAX_CACHED: usize = 64;

#[derive(Debug)]
struct PoolInner {
    classes: Mutex<HashMap<usize, Vec<BytesMut>>>,
    max_cached: usize,
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

/// Allocates and recycles fixed-capacity [`Buffer`]s.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_cached(DEFAULT_MAX_CACHED)
    }

    /// Create a pool that keeps at most `max_cached` free buffers per class
    pub fn with_max_cached(max_cached: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                classes: Mutex::new(HashMap::new()),
                max_cached,
                outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire a buffer whose usable window is exactly `size` bytes
    pub fn acquire(&self, size: usize) -> Buffer {
        let class = size_class(size);
        let cached = self.inner.classes.lock().get_mut(&class).and_then(Vec::pop);

        let data = match cached {
            Some(data) => data,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::zeroed(class)
            }
        };

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Buffer::new(data, size)
    }

    /// Return a buffer to the pool
    ///
    /// Taking the buffer by value is what makes a double release impossible.
    pub fn release(&self, buf: Buffer) {
        if !buf.is_pooled() {
            return;
        }
        let data = buf.into_storage();
        let class = data.len();
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);

        let mut classes = self.inner.classes.lock();
        let free = classes.entry(class).or_default();
        if free.len() < self.inner.max_cached {
            free.push(data);
        }
    }

    /// Release every buffer in `bufs`
    pub fn release_all(&self, bufs: impl IntoIterator<Item = Buffer>) {
        for buf in bufs {
            self.release(buf);
        }
    }

    /// Buffers handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Storage blocks allocated over the pool's lifetime
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

fn size_class(size: usize) -> usize {
    size.max(MIN_CLASS).next_power_of_two()
}
