//! Fixed-size byte buffer pool for part downloads
//!
//! Buffers go back to the pool when the [`PooledBuffer`] holding them is dropped, so every
//! path that lets go of a part (consumed by a reader, failed download, abandoned send,
//! teardown) returns it exactly once. The pool keeps counters so tests can check that nothing
//! is leaked.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut free = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buffer);
        }
        drop(free);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cloneable handle to a shared pool of buffers with capacity `buffer_size`
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: std::sync::Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `buffer_size` capacity, keeping at most
    /// `max_idle` of them around for reuse.
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(PoolInner {
                buffer_size,
                max_idle,
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes an empty buffer out of the pool, allocating one if none is idle.
    pub fn get(&self) -> PooledBuffer {
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop();
        let buffer = reused.unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::AcqRel);
            Vec::with_capacity(self.inner.buffer_size)
        });
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buffer,
            pool: self.inner.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers currently handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Buffers allocated over the lifetime of the pool
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// Buffers waiting in the pool for reuse
    pub fn idle(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// A buffer borrowed from a [`BufferPool`], returned to it on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: std::sync::Arc<PoolInner>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(16, 4);
        {
            let mut buffer = pool.get();
            assert!(buffer.capacity() >= 16);
            buffer.extend_from_slice(b"abc");
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);
        let buffer = pool.get();
        assert!(buffer.is_empty());
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn idle_buffers_are_capped() {
        let pool = BufferPool::new(8, 2);
        let buffers: Vec<_> = (0..5).map(|_| pool.get()).collect();
        assert_eq!(pool.outstanding(), 5);
        assert_eq!(pool.allocated(), 5);
        drop(buffers);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn concurrent_get_and_put() {
        let pool = BufferPool::new(32, 8);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..1000u32 {
                        let mut buffer = pool.get();
                        buffer.extend_from_slice(&i.to_le_bytes());
                    }
                });
            }
        });
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.allocated() <= 8 + 8);
    }
}
