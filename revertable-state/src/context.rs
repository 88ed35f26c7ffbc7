//! Per-round and per-worker execution context.
//!
//! Everything the core needs from its surroundings during a round (the
//! short-hash allocator and the generation id source) is reached through an
//! explicit [`WorkerContext`] handle rather than thread-local state.

use crate::types::HashSetEntry;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide monotonically increasing id source.
#[derive(Debug)]
pub struct IdSource {
    next: AtomicU64,
}

impl IdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Short-hash allocator: hands out compact tokens for hash-set entries.
///
/// One append-only segment per worker. A worker only ever appends to its own
/// segment, but any worker may resolve any token.
///
/// Token layout: `(worker_id + 1) << 32 | (offset + 1)`. Neither half is ever
/// zero, so `0` and `u64::MAX` stay free for "empty" and "tombstone".
#[derive(Debug)]
pub struct HashArena {
    segments: Vec<RwLock<Vec<HashSetEntry>>>,
}

impl HashArena {
    pub fn new(num_workers: usize) -> Self {
        assert!(
            num_workers > 0 && num_workers < u32::MAX as usize,
            "worker count {num_workers} out of range"
        );
        Self {
            segments: (0..num_workers).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.segments.len()
    }

    /// Stores `entry` in the worker's segment and returns its token.
    ///
    /// The token stays valid until the next [`HashArena::reset`].
    pub fn allocate(&self, worker_id: usize, entry: HashSetEntry) -> u64 {
        let mut segment = self.segments[worker_id].write();
        let offset = segment.len();
        // The all-ones offset would collide with the tombstone sentinel.
        assert!(
            offset < (u32::MAX - 1) as usize,
            "hash arena segment {worker_id} exhausted"
        );
        segment.push(entry);
        ((worker_id as u64 + 1) << 32) | (offset as u64 + 1)
    }

    /// Returns the entry a token was allocated for.
    ///
    /// # Panics
    ///
    /// Panics on a token this arena never issued in the current round.
    pub fn resolve(&self, token: u64) -> HashSetEntry {
        let worker = (token >> 32) as usize;
        let offset = (token & u64::from(u32::MAX)) as usize;
        worker
            .checked_sub(1)
            .zip(offset.checked_sub(1))
            .and_then(|(worker, offset)| {
                self.segments
                    .get(worker)
                    .and_then(|segment| segment.read().get(offset).copied())
            })
            .unwrap_or_else(|| panic!("unknown hash token {token:#x}"))
    }

    /// Number of entries allocated across all segments.
    pub fn allocated(&self) -> usize {
        self.segments.iter().map(|segment| segment.read().len()).sum()
    }

    /// Invalidates every token. Called once per round boundary.
    pub fn reset(&mut self) {
        for segment in &mut self.segments {
            segment.get_mut().clear();
        }
    }
}

/// State shared by all workers of a round.
#[derive(Debug)]
pub struct RoundContext {
    arena: HashArena,
    ids: Arc<IdSource>,
}

impl RoundContext {
    /// Creates a round context for `num_workers` workers with a fresh id source.
    pub fn new(num_workers: usize) -> Self {
        Self::with_ids(num_workers, Arc::new(IdSource::new()))
    }

    /// Creates a round context sharing an existing id source.
    pub fn with_ids(num_workers: usize, ids: Arc<IdSource>) -> Self {
        Self {
            arena: HashArena::new(num_workers),
            ids,
        }
    }

    pub fn arena(&self) -> &HashArena {
        &self.arena
    }

    pub fn num_workers(&self) -> usize {
        self.arena.num_workers()
    }

    /// Hands out the context for one worker.
    ///
    /// # Panics
    ///
    /// Panics if `worker_id` is not below the configured worker count.
    pub fn worker(&self, worker_id: usize) -> WorkerContext<'_> {
        assert!(
            worker_id < self.num_workers(),
            "worker id {worker_id} out of range for {} workers",
            self.num_workers()
        );
        WorkerContext {
            worker_id,
            round: self,
        }
    }

    /// Resets round-scoped allocations. Requires that no worker context is alive.
    pub fn reset(&mut self) {
        self.arena.reset();
    }
}

/// Handle a worker passes into every core call.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'r> {
    worker_id: usize,
    round: &'r RoundContext,
}

impl<'r> WorkerContext<'r> {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn arena(&self) -> &'r HashArena {
        &self.round.arena
    }

    pub fn allocate(&self, entry: HashSetEntry) -> u64 {
        self.round.arena.allocate(self.worker_id, entry)
    }

    pub fn resolve(&self, token: u64) -> HashSetEntry {
        self.round.arena.resolve(token)
    }

    pub fn next_id(&self) -> u64 {
        self.round.ids.next_id()
    }
}
