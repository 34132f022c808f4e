//! `ChunkPool` — default `ChunkProvider` implementation.
//!
//! Every chunk handed out reserves `CHUNK_SIZE` bytes against the shared
//! `MemoryBudget`. Dropped chunks park their page on a bounded free list
//! together with that reservation, so the budget counts every resident
//! page, idle or not. Pages beyond the free-list capacity go back to the
//! allocator and release their bytes. Other reservations that find the
//! budget full evict idle pages first ([`ChunkPool::reserve`]).

use pinio_core::buffer::{Chunk, ChunkProvider, MemoryBudget, PageRecycler, Reservation, CHUNK_SIZE};

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct PoolShared {
    budget: Arc<MemoryBudget>,
    /// Recycled pages, still charged to the budget.
    free: ArrayQueue<(Box<[u8]>, Reservation)>,
    /// Chunks currently alive.
    in_use: AtomicUsize,
    /// Pages ever taken from the allocator (for diagnostics).
    allocated: AtomicUsize,
}

impl PageRecycler for PoolShared {
    fn recycle(&self, page: Box<[u8]>, reservation: Reservation) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        // Full free list: let the page and its bytes go.
        let _ = self.free.push((page, reservation));
    }
}

#[derive(Clone)]
pub struct ChunkPool {
    shared: Arc<PoolShared>,
}

impl ChunkPool {
    /// `cache` is the number of idle pages kept for reuse.
    pub fn new(budget: Arc<MemoryBudget>, cache: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                budget,
                free: ArrayQueue::new(cache.max(1)),
                in_use: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.shared.budget
    }

    /// Idle pages waiting for reuse.
    pub fn cached(&self) -> usize {
        self.shared.free.len()
    }

    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Reserve `bytes` for something other than a page, evicting idle
    /// pages while the budget is full.
    pub fn reserve(&self, bytes: usize) -> Option<Reservation> {
        loop {
            if let Some(r) = self.shared.budget.try_reserve(bytes) {
                return Some(r);
            }
            self.shared.free.pop()?;
        }
    }

    /// Release every idle page. Returns how many were dropped.
    pub fn trim(&self) -> usize {
        let mut n = 0;
        while self.shared.free.pop().is_some() {
            n += 1;
        }
        n
    }
}

impl ChunkProvider for ChunkPool {
    fn alloc(&self) -> Option<Chunk> {
        let (page, reservation) = match self.shared.free.pop() {
            Some(idle) => idle,
            None => {
                let reservation = self.shared.budget.try_reserve(CHUNK_SIZE)?;
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                (vec![0u8; CHUNK_SIZE].into_boxed_slice(), reservation)
            }
        };
        self.shared.in_use.fetch_add(1, Ordering::AcqRel);
        let recycler: Arc<dyn PageRecycler> = self.shared.clone();
        Some(Chunk::pooled(page, reservation, recycler))
    }

    fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize) -> ChunkPool {
        ChunkPool::new(Arc::new(MemoryBudget::new(pages * CHUNK_SIZE)), 8)
    }

    #[test]
    fn test_alloc_until_budget_exhausted() {
        let pool = pool(3);
        let chunks: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 3);
        assert_eq!(pool.budget().in_use(), 3 * CHUNK_SIZE);
        drop(chunks);
        assert_eq!(pool.in_use(), 0);
        // Idle pages stay charged until they leave the cache.
        assert_eq!(pool.cached(), 3);
        assert_eq!(pool.budget().in_use(), 3 * CHUNK_SIZE);
        let _kept = pool.alloc().unwrap();
        assert_eq!(pool.budget().in_use(), 3 * CHUNK_SIZE);
        assert_eq!(pool.trim(), 2);
        assert_eq!(pool.budget().in_use(), CHUNK_SIZE);
    }

    #[test]
    fn test_cache_overflow_releases_bytes() {
        let pool = ChunkPool::new(Arc::new(MemoryBudget::new(4 * CHUNK_SIZE)), 1);
        let chunks: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        drop(chunks);
        assert_eq!(pool.cached(), 1);
        assert_eq!(pool.budget().in_use(), CHUNK_SIZE);
    }

    #[test]
    fn test_reserve_evicts_idle_pages() {
        let pool = pool(2);
        drop(pool.alloc_many(2).unwrap());
        assert_eq!(pool.cached(), 2);
        assert_eq!(pool.budget().available(), 0);

        let r = pool.reserve(100).unwrap();
        assert_eq!(r.bytes(), 100);
        assert_eq!(pool.cached(), 1);
        // Nothing left to evict.
        let _held = pool.alloc().unwrap();
        assert!(pool.reserve(CHUNK_SIZE).is_none());
    }

    #[test]
    fn test_pages_are_reused() {
        let pool = pool(2);
        let c = pool.alloc().unwrap();
        assert_eq!(c.capacity(), CHUNK_SIZE);
        drop(c);
        assert_eq!(pool.cached(), 1);
        let _c = pool.alloc().unwrap();
        assert_eq!(pool.cached(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_alloc_many_all_or_nothing() {
        let pool = pool(4);
        let _held = pool.alloc().unwrap();
        assert!(pool.alloc_many(4).is_none());
        // The partial allocation was rolled back.
        assert_eq!(pool.in_use(), 1);
        let got = pool.alloc_many(3).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn test_recycled_chunk_starts_empty() {
        let pool = pool(1);
        let mut c = pool.alloc().unwrap();
        c.append(b"stale");
        drop(c);
        let c = pool.alloc().unwrap();
        assert!(c.is_empty());
        assert_eq!(c.spare(), CHUNK_SIZE);
    }
}
