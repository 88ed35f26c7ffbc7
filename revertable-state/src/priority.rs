//! Deterministic ordering of conflicting deltas.
//!
//! Every `(delta, priority)` pair gets a rank that does not depend on thread
//! scheduling, so conflict resolution over one key's deltas reproduces
//! exactly across re-executions.
//!
//! Greater means "resolved first":
//!
//! 1. `DeleteFirst` deltas rank above everything else on the key.
//! 2. All non-delete kinds rank together by `custom_priority`, then `tx_hash`.
//! 3. `DeleteLast` deltas rank below everything else.
//!
//! Remaining ties (same rank and priority, different payloads) fall back to
//! the delta's own ordering, which keeps the order strict.

use crate::types::{DeltaKind, StorageDelta};
use alloy_primitives::B256;
use std::cmp::Ordering;

/// Priority attached to every delta of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeltaPriority {
    pub custom_priority: u64,
    pub tx_hash: B256,
}

impl DeltaPriority {
    pub fn new(custom_priority: u64, tx_hash: B256) -> Self {
        Self {
            custom_priority,
            tx_hash,
        }
    }
}

impl Ord for DeltaPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.custom_priority
            .cmp(&other.custom_priority)
            .then_with(|| self.tx_hash.cmp(&other.tx_hash))
    }
}

impl PartialOrd for DeltaPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn kind_rank(kind: DeltaKind) -> u8 {
    match kind {
        DeltaKind::DeleteLast => 0,
        DeltaKind::DeleteFirst => 2,
        _ => 1,
    }
}

/// Total order over `(delta, priority)` pairs targeting the same key.
pub fn compare_prioritized(
    (delta_a, priority_a): (&StorageDelta, &DeltaPriority),
    (delta_b, priority_b): (&StorageDelta, &DeltaPriority),
) -> Ordering {
    kind_rank(delta_a.kind())
        .cmp(&kind_rank(delta_b.kind()))
        .then_with(|| priority_a.cmp(priority_b))
        .then_with(|| delta_a.cmp(delta_b))
}

/// A delta paired with its priority, ordered by [`compare_prioritized`].
///
/// Suitable as a `BTreeSet` element; iterate in reverse to visit deltas in
/// resolution order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrioritizedDelta {
    pub delta: StorageDelta,
    pub priority: DeltaPriority,
}

impl PrioritizedDelta {
    pub fn new(delta: StorageDelta, priority: DeltaPriority) -> Self {
        Self { delta, priority }
    }
}

impl Ord for PrioritizedDelta {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_prioritized(
            (&self.delta, &self.priority),
            (&other.delta, &other.priority),
        )
    }
}

impl PartialOrd for PrioritizedDelta {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorts deltas into resolution order (highest rank first).
pub fn sort_for_resolution(deltas: &mut [PrioritizedDelta]) {
    deltas.sort_unstable_by(|a, b| b.cmp(a));
}
