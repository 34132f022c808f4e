//! Buffer chunks and the memory budget.
//!
//! A [`Chunk`] is one page (normally [`CHUNK_SIZE`] bytes) with `begin`/`end`
//! cursors: bytes in `begin..end` are filled, bytes past `end` are spare.
//! Chunks handed out by a [`ChunkProvider`] carry a [`Reservation`] against
//! the shared [`MemoryBudget`] and return their page to the provider on
//! drop, so a chunk can never outlive its accounting.
//!
//! # Implementors
//!
//! - `ChunkPool` (pinio-module, default): bounded free list of pages,
//!   every live page reserved against the budget.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Size of one outbound/inbound page.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Size of the receive probe used when the caller does not expect more data.
pub const LEADER_SIZE: usize = 8;

/// Process-wide (or gateway-wide) cap on buffer and pin memory.
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Reserve `bytes` or fail without side effects.
    pub fn try_reserve(self: &Arc<Self>, bytes: usize) -> Option<Reservation> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(bytes)?;
            if next > self.limit {
                return None;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        budget: Arc::clone(self),
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_use())
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("limit", &self.limit)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Bytes held against a [`MemoryBudget`]; released on drop.
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reservation({} bytes)", self.bytes)
    }
}

/// Takes back pages when pooled chunks are dropped.
pub trait PageRecycler: Send + Sync {
    fn recycle(&self, page: Box<[u8]>, reservation: Reservation);
}

/// Hands out budgeted chunks.
///
/// **Contract:**
/// - `alloc()` never blocks; `None` means the budget is exhausted.
/// - A dropped chunk releases its reservation before `alloc()` can
///   observe the freed space.
pub trait ChunkProvider: Send + Sync {
    fn alloc(&self) -> Option<Chunk>;

    /// All-or-nothing allocation of `n` chunks.
    fn alloc_many(&self, n: usize) -> Option<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(n);
        for _ in 0..n {
            chunks.push(self.alloc()?);
        }
        Some(chunks)
    }

    /// Chunks currently alive.
    fn in_use(&self) -> usize;
}

struct ChunkHome {
    recycler: Arc<dyn PageRecycler>,
    reservation: Reservation,
}

/// One page with fill cursors.
pub struct Chunk {
    data: Box<[u8]>,
    begin: usize,
    end: usize,
    home: Option<ChunkHome>,
}

impl Chunk {
    /// Unbudgeted chunk (leader probes, tests).
    pub fn detached(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            begin: 0,
            end: 0,
            home: None,
        }
    }

    /// Budgeted chunk that returns `data` to `recycler` on drop.
    pub fn pooled(
        data: Box<[u8]>,
        reservation: Reservation,
        recycler: Arc<dyn PageRecycler>,
    ) -> Self {
        Self {
            data,
            begin: 0,
            end: 0,
            home: Some(ChunkHome {
                recycler,
                reservation,
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Filled, not yet consumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Room left past `end`.
    #[inline]
    pub fn spare(&self) -> usize {
        self.data.len() - self.end
    }

    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    #[inline]
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Whole page, regardless of cursors.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy as much of `bytes` as fits; returns the count copied.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.spare());
        self.data[self.end..self.end + n].copy_from_slice(&bytes[..n]);
        self.end += n;
        n
    }

    /// Mark `n` spare bytes as filled.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.spare(), "commit past end of chunk");
        self.end += n;
    }

    /// Consume `n` filled bytes from the front.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance past filled bytes");
        self.begin += n;
    }

    pub fn reset(&mut self) {
        self.begin = 0;
        self.end = 0;
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            let page = std::mem::take(&mut self.data);
            home.recycler.recycle(page, home.reservation);
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("capacity", &self.capacity())
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
