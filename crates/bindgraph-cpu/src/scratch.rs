// Scratch Pool — Caching allocator for host activation buffers
//
// Activations, gradients and temporaries all live in plain Vec<f64> buffers.
// Instead of dropping a buffer when a pass is done with it, the plan hands
// it back here; the next request for the same element count pops it from the
// free list instead of allocating.
//
// A plan bound with a donor shares the donor's pool through an Arc, so a
// training executor and an inference executor over the same graph recycle
// one set of buffers between them.
//
//   let buf = pool.take(1024);     // zeroed, from cache when possible
//   pool.give(buf);                // return for reuse
//   let stats = pool.stats();      // hits / misses / cached bytes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

// Pool statistics

/// Snapshot of a pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total bytes currently held in the cache.
    pub cached_bytes: usize,
    /// Number of buffers currently in the cache.
    pub cached_buffers: usize,
    /// Requests served from the cache.
    pub hits: u64,
    /// Requests that fell through to a fresh allocation.
    pub misses: u64,
}

// ScratchPool

/// Free lists of `f64` buffers keyed by element count.
#[derive(Debug, Default)]
pub struct ScratchPool {
    buckets: Mutex<HashMap<usize, Vec<Vec<f64>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<usize, Vec<Vec<f64>>>> {
        // A panic while holding the lock cannot leave a bucket half-edited.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A zeroed buffer of `len` elements.
    pub fn take(&self, len: usize) -> Vec<f64> {
        let cached = self.buckets().get_mut(&len).and_then(|stack| stack.pop());
        match cached {
            Some(mut buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf.fill(0.0);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0.0; len]
            }
        }
    }

    /// Return a buffer for reuse. Empty buffers are dropped.
    pub fn give(&self, buf: Vec<f64>) {
        if buf.is_empty() {
            return;
        }
        self.buckets().entry(buf.len()).or_default().push(buf);
    }

    /// Drop every cached buffer. Returns how many were freed.
    pub fn empty_cache(&self) -> usize {
        self.buckets().drain().map(|(_, stack)| stack.len()).sum()
    }

    pub fn stats(&self) -> PoolStats {
        let map = self.buckets();
        let mut cached_buffers = 0;
        let mut cached_bytes = 0;
        for (len, stack) in map.iter() {
            cached_buffers += stack.len();
            cached_bytes += len * stack.len() * std::mem::size_of::<f64>();
        }
        PoolStats {
            cached_bytes,
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_counts_as_hit() {
        let pool = ScratchPool::new();
        let mut buf = pool.take(4);
        buf[0] = 7.0;
        pool.give(buf);

        let again = pool.take(4);
        assert_eq!(again, vec![0.0; 4]);
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached_buffers, 0);
    }

    #[test]
    fn test_sizes_do_not_mix() {
        let pool = ScratchPool::new();
        pool.give(vec![1.0; 3]);
        let buf = pool.take(5);
        assert_eq!(buf.len(), 5);
        assert_eq!(pool.stats().misses, 1);
        assert_eq!(pool.stats().cached_bytes, 3 * 8);
    }

    #[test]
    fn test_empty_cache() {
        let pool = ScratchPool::new();
        pool.give(vec![0.0; 2]);
        pool.give(vec![0.0; 2]);
        pool.give(Vec::new());
        assert_eq!(pool.empty_cache(), 2);
        assert_eq!(pool.stats().cached_buffers, 0);
    }
}
