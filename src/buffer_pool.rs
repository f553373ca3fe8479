//! Size-bounded pool of scratch buffers for record encoding.
//!
//! Buffers are checked out as [`PooledBuffer`] and go back to the pool on
//! drop. A returned buffer is dropped instead of pooled when the pool already
//! holds `max_buffers` idle buffers or the buffer grew past
//! `max_buffer_capacity`.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::config::BufferPoolConfig;

pub const DEFAULT_MAX_BUFFERS: usize = 64;
pub const DEFAULT_MAX_BUFFER_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub idle: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    max_buffer_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    pub fn new(max_buffers: usize, max_buffer_capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
            max_buffer_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BufferPoolConfig) -> Self {
        Self::new(config.max_buffers, config.max_buffer_capacity)
    }

    /// Take an empty buffer, reusing an idle one when available.
    pub fn checkout(&self) -> PooledBuffer<'_> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let buf = match reused {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        PooledBuffer { buf, pool: self }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_buffer_capacity {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_buffers {
                buf.clear();
                idle.push(buf);
                return;
            }
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or(0),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS, DEFAULT_MAX_BUFFER_CAPACITY)
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// A buffer that never allocated is not returned.
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl PooledBuffer<'_> {
    /// Keep the bytes and detach the buffer from the pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 {
            self.pool.give_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reuses_returned_buffer() {
        let pool = BufferPool::new(2, 1024);
        {
            let mut buf = pool.checkout();
            buf.extend_from_slice(b"scratch");
        }
        let buf = pool.checkout();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 7);

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn oversized_buffer_is_evicted() {
        let pool = BufferPool::new(4, 16);
        {
            let mut buf = pool.checkout();
            buf.resize(1024, 0);
        }
        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn full_pool_evicts_extra_buffers() {
        let pool = BufferPool::new(1, 1024);
        let mut a = pool.checkout();
        let mut b = pool.checkout();
        a.push(1);
        b.push(2);
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn into_vec_detaches_buffer() {
        let pool = BufferPool::new(1, 1024);
        let mut buf = pool.checkout();
        buf.push(9);
        let bytes = buf.into_vec();
        assert_eq!(bytes, vec![9]);
        assert_eq!(pool.stats().idle, 0);
    }
}
