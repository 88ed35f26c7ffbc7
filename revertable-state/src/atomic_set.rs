//! Lock-free open-addressed set of hash-set entries.
//!
//! Slots hold short-hash tokens issued by the round's [`HashArena`], never
//! full hashes. Equality is decided on the full hash after resolving the
//! token, so the same hash under two different indices is a duplicate.
//!
//! Slot states only move forward during a round:
//!
//! ```text
//! EMPTY --insert--> token --erase--> TOMBSTONE
//! ```
//!
//! which means the first empty slot along a probe sequence is stable, and two
//! racing inserts of the same hash always meet on the same slot.

use crate::context::{HashArena, WorkerContext};
use crate::error::Rejection;
use crate::types::HashSetEntry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use xxhash_rust::xxh3::xxh3_64_with_seed;

const EMPTY: u64 = 0;

/// Marks a slot whose entry was erased. Probing continues past it.
pub const TOMBSTONE: u64 = u64::MAX;

const PROBE_SEED: u64 = 0x5eed_a70c_5e75_0001;

/// Fixed-capacity concurrent set.
///
/// `try_insert` and `erase` may race freely. `clear` and `resize` take
/// `&mut self` and therefore only run between rounds.
#[derive(Debug)]
pub struct AtomicSet {
    slots: Box<[AtomicU64]>,
    max_size: usize,
    num_filled: AtomicUsize,
}

/// Slot count for a requested capacity: 20% headroom over the live limit.
fn slot_count(capacity: usize) -> usize {
    capacity + capacity.div_ceil(5)
}

fn empty_slots(count: usize) -> Box<[AtomicU64]> {
    (0..count).map(|_| AtomicU64::new(EMPTY)).collect()
}

impl AtomicSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: empty_slots(slot_count(capacity)),
            max_size: capacity,
            num_filled: AtomicUsize::new(0),
        }
    }

    /// Sets the live-entry limit to `capacity` and clears every entry.
    ///
    /// The slot table is reallocated only when it has to grow.
    pub fn resize(&mut self, capacity: usize) {
        let needed = slot_count(capacity);
        if needed > self.slots.len() {
            self.slots = empty_slots(needed);
        } else {
            self.clear_slots();
        }
        self.max_size = capacity;
        *self.num_filled.get_mut() = 0;
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.clear_slots();
        *self.num_filled.get_mut() = 0;
    }

    fn clear_slots(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.get_mut() = EMPTY;
        }
    }

    /// Maximum number of live entries.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Current number of live entries. May be stale under concurrency.
    pub fn len(&self) -> usize {
        self.num_filled.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start_slot(&self, entry: &HashSetEntry) -> usize {
        let hash = xxh3_64_with_seed(entry.hash.as_slice(), PROBE_SEED);
        ((u128::from(hash) * self.slots.len() as u128) >> 64) as usize
    }

    /// Slot indices along the probe sequence of `entry`, wrapping once.
    fn probe(&self, entry: &HashSetEntry) -> impl Iterator<Item = usize> {
        let len = self.slots.len();
        let start = if len == 0 { 0 } else { self.start_slot(entry) };
        (0..len).map(move |step| (start + step) % len)
    }

    /// Inserts `entry`, returning `false` if its hash is already present or
    /// the set is full.
    pub fn try_insert(&self, ctx: &WorkerContext<'_>, entry: HashSetEntry) -> bool {
        self.insert(ctx, entry).is_ok()
    }

    /// Inserts `entry`, reporting why it was refused.
    ///
    /// Fails with [`Rejection::DuplicateHash`] if the hash is present, and with
    /// [`Rejection::CapacityExceeded`] if the live limit is reached or no
    /// empty slot is left because erased entries filled the table.
    pub fn insert(&self, ctx: &WorkerContext<'_>, entry: HashSetEntry) -> Result<(), Rejection> {
        // Reserve a live-entry slot up front so concurrent inserters can never
        // overshoot the limit together.
        self.num_filled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |filled| {
                (filled < self.max_size).then_some(filled + 1)
            })
            .map_err(|_| Rejection::CapacityExceeded)?;

        let mut token = None;
        for index in self.probe(&entry) {
            let slot = &self.slots[index];
            let mut current = slot.load(Ordering::Acquire);
            loop {
                match current {
                    EMPTY => {
                        let new_token = *token.get_or_insert_with(|| ctx.allocate(entry));
                        match slot.compare_exchange(
                            EMPTY,
                            new_token,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => return Ok(()),
                            // Lost the slot; look at what the winner stored.
                            Err(observed) => current = observed,
                        }
                    }
                    TOMBSTONE => break,
                    occupied => {
                        if ctx.resolve(occupied).hash == entry.hash {
                            self.num_filled.fetch_sub(1, Ordering::AcqRel);
                            return Err(Rejection::DuplicateHash);
                        }
                        break;
                    }
                }
            }
        }

        self.num_filled.fetch_sub(1, Ordering::AcqRel);
        Err(Rejection::CapacityExceeded)
    }

    /// Erases the entry with `entry`'s hash.
    ///
    /// # Panics
    ///
    /// Panics if no such entry is present. Callers must only erase entries
    /// they inserted.
    pub fn erase(&self, ctx: &WorkerContext<'_>, entry: HashSetEntry) {
        for index in self.probe(&entry) {
            let slot = &self.slots[index];
            let current = slot.load(Ordering::Acquire);
            match current {
                EMPTY => break,
                TOMBSTONE => continue,
                occupied => {
                    if ctx.resolve(occupied).hash != entry.hash {
                        continue;
                    }
                    if slot
                        .compare_exchange(occupied, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.num_filled.fetch_sub(1, Ordering::AcqRel);
                        return;
                    }
                    // Someone else erased our entry first.
                    break;
                }
            }
        }
        panic!("erase of absent hash set entry {:?}", entry.hash);
    }

    /// Snapshot of the live entries, in slot order.
    pub fn get_hashes(&self, arena: &HashArena) -> Vec<HashSetEntry> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&token| token != EMPTY && token != TOMBSTONE)
            .map(|token| arena.resolve(token))
            .collect()
    }
}
