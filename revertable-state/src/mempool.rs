//! Bounded ring buffer handing incoming transactions to block assembly.
//!
//! Consumers claim slots lock-free; producers are serialized by a mutex.
//! The whole ring position lives in one 64-bit word:
//!
//! ```text
//! | filled_index: u32 | consumed_index: u32 |
//! ```
//!
//! Both indices count up forever and wrap at 2^32. Because the capacity is a
//! power of two no larger than 2^31, `index & mask` names the same slot on
//! either side of that wrap.

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const MAX_CAPACITY: usize = 1 << 31;

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    /// Set by the producer after writing, cleared by the consumer after
    /// moving the value out.
    full: AtomicBool,
}

/// Multi-producer, multi-consumer bounded transaction queue.
pub struct Mempool<T> {
    slots: Box<[Slot<T>]>,
    mask: u32,
    state: CachePadded<AtomicU64>,
    producer: Mutex<()>,
}

// SAFETY: a slot's value is only touched by the producer that filled it
// (under `producer`) or by the single consumer that claimed its index via CAS
// on `state`; the `full` flag orders the hand-off between the two.
unsafe impl<T: Send> Send for Mempool<T> {}
unsafe impl<T: Send> Sync for Mempool<T> {}

fn pack(filled: u32, consumed: u32) -> u64 {
    (u64::from(filled) << 32) | u64::from(consumed)
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

impl<T> Mempool<T> {
    /// Creates an empty mempool.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two no larger than 2^31.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= MAX_CAPACITY,
            "mempool capacity {capacity} must be a power of two no larger than 2^31"
        );
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                    full: AtomicBool::new(false),
                })
                .collect(),
            mask: (capacity - 1) as u32,
            state: CachePadded::new(AtomicU64::new(0)),
            producer: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: u32) -> &Slot<T> {
        &self.slots[(index & self.mask) as usize]
    }

    /// Distance from consumed to filled, or zero if the snapshot looks inverted.
    fn occupancy(&self, state: u64) -> usize {
        let (filled, consumed) = unpack(state);
        let in_use = filled.wrapping_sub(consumed) as usize;
        if in_use > self.capacity() {
            0
        } else {
            in_use
        }
    }

    /// Moves as many transactions from the front of `batch` as currently fit.
    ///
    /// Returns the number written; those items are removed from `batch` and
    /// the remainder stays for the caller to retry.
    pub fn add_txs(&self, batch: &mut Vec<T>) -> usize {
        let _producer = self.producer.lock();

        let state = self.state.load(Ordering::Acquire);
        let (filled, _) = unpack(state);
        // `consumed` only grows, so this under-estimates free space.
        let free = self.capacity() - self.occupancy(state);
        let count = free.min(batch.len());

        for (offset, tx) in batch.drain(..count).enumerate() {
            let slot = self.slot(filled.wrapping_add(offset as u32));
            // The consumer that claimed this slot last lap may still be
            // moving its value out.
            let backoff = Backoff::new();
            while slot.full.load(Ordering::Acquire) {
                backoff.snooze();
            }
            // SAFETY: the slot is empty and unclaimed, and we hold the
            // producer lock.
            unsafe { (*slot.value.get()).write(tx) };
            slot.full.store(true, Ordering::Release);
        }

        if count > 0 {
            // Carries out of the top bit are discarded, which is exactly the
            // u32 wrap of `filled`.
            self.state
                .fetch_add((count as u64) << 32, Ordering::AcqRel);
        }
        count
    }

    /// Claims and returns the oldest transaction, or `None` if empty.
    pub fn get_new_tx(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let (filled, consumed) = unpack(state);
            if filled == consumed {
                return None;
            }
            let next = pack(filled, consumed.wrapping_add(1));
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let slot = self.slot(consumed);
                    // SAFETY: winning the CAS gives us sole ownership of index
                    // `consumed`, and the producer published the value before
                    // advancing `filled` past it.
                    let tx = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.full.store(false, Ordering::Release);
                    return Some(tx);
                }
                Err(observed) => {
                    state = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Approximate number of queued transactions. May be stale.
    pub fn available_size(&self) -> usize {
        self.occupancy(self.state.load(Ordering::Acquire))
    }
}

impl<T> Drop for Mempool<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.full.get_mut() {
                // SAFETY: `full` means the value was written and never taken.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> std::fmt::Debug for Mempool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("capacity", &self.capacity())
            .field("available", &self.available_size())
            .finish()
    }
}
