//! Per-key aggregate of speculative deltas.
//!
//! A [`RevertableObject`] turns each delta kind into a base-slot write plus
//! kind-specific bookkeeping, and folds everything that survived into the
//! key's committed value at round end.
//!
//! Delta lifecycle inside a round:
//!
//! ```text
//! try_add_delta --accepted--> DeltaGuard --commit--> counted in commit_round
//!               \                       \--drop----> fully undone
//!                \--rejected--> None (no side effects)
//! ```

use crate::atomic_set::AtomicSet;
use crate::base_object::{BaseGuard, RevertableBaseObject};
use crate::context::{HashArena, WorkerContext};
use crate::error::Rejection;
use crate::types::{
    HashSetEntry, HashSetValue, ObjectType, StorageDelta, StorageObject, HASH_SET_MAX_SIZE,
};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tracing::trace;

/// What must be undone (on revert) or counted (on commit) for one delta.
#[derive(Debug, Clone, Copy)]
enum DeltaRecord {
    RawMemoryWrite,
    Added(u64),
    Subtracted(i64),
    SizeIncrease(u64),
    Insert(HashSetEntry),
    Clear(u64),
    AssetDecrease(u64),
    AssetIncrease(u64),
    DeleteLast,
}

/// One key's state: the committed value plus this round's accumulators.
#[derive(Debug)]
pub struct RevertableObject {
    base: RevertableBaseObject,
    committed_base: Option<StorageObject>,

    total_added: AtomicU64,
    /// Sum of accepted negative deltas; never positive.
    total_subtracted: AtomicI64,

    /// Growth from every accepted limit increase.
    size_increase: AtomicU64,
    /// Growth from committed limit increases only; inserts are admitted
    /// against this, since a reverted increase must not leave extra entries.
    committed_size_increase: AtomicU64,
    new_hashes: AtomicSet,
    num_new_elts: AtomicU64,
    hashset_clear_committed: AtomicBool,
    max_committed_clear_threshold: AtomicU64,

    /// Lower bound: committed amount plus every accepted debit.
    available_asset: AtomicU64,
    /// Upper bound: committed amount plus every accepted credit.
    available_asset_upperbound: AtomicU64,

    delete_last_committed: AtomicBool,
}

impl RevertableObject {
    /// Creates the object for a key whose durable value is `committed`.
    pub fn new(committed: Option<StorageObject>) -> Self {
        let mut object = Self {
            base: RevertableBaseObject::new(committed.as_ref().map(StorageObject::object_type)),
            committed_base: committed,
            total_added: AtomicU64::new(0),
            total_subtracted: AtomicI64::new(0),
            size_increase: AtomicU64::new(0),
            committed_size_increase: AtomicU64::new(0),
            new_hashes: AtomicSet::new(0),
            num_new_elts: AtomicU64::new(0),
            hashset_clear_committed: AtomicBool::new(false),
            max_committed_clear_threshold: AtomicU64::new(0),
            available_asset: AtomicU64::new(0),
            available_asset_upperbound: AtomicU64::new(0),
            delete_last_committed: AtomicBool::new(false),
        };
        object.clear_mods();
        object
    }

    /// The last durable value of the key.
    pub fn committed(&self) -> Option<&StorageObject> {
        self.committed_base.as_ref()
    }

    pub fn required_type(&self) -> Option<ObjectType> {
        self.base.required_type()
    }

    /// Current `(lower, upper)` asset bounds. May be stale.
    pub fn asset_bounds(&self) -> (u64, u64) {
        (
            self.available_asset.load(Ordering::Acquire),
            self.available_asset_upperbound.load(Ordering::Acquire),
        )
    }

    fn committed_hash_set(&self) -> Option<&HashSetValue> {
        match &self.committed_base {
            Some(StorageObject::HashSet(set)) => Some(set),
            _ => None,
        }
    }

    fn committed_asset(&self) -> u64 {
        match self.committed_base {
            Some(StorageObject::KnownSupplyAsset(amount)) => amount,
            _ => 0,
        }
    }

    /// Attempts to apply `delta` speculatively.
    ///
    /// Returns `None` on a conflict or resource limit; nothing is changed in
    /// that case.
    ///
    /// # Panics
    ///
    /// Panics on [`StorageDelta::DeleteFirst`], which has no execution path.
    pub fn try_add_delta<'a>(
        &'a self,
        ctx: &'a WorkerContext<'_>,
        delta: &StorageDelta,
    ) -> Option<DeltaGuard<'a>> {
        match self.add_delta(ctx, delta) {
            Ok((base, record)) => Some(DeltaGuard {
                object: self,
                ctx,
                base,
                record,
                finished: false,
            }),
            Err(rejection) => {
                trace!(kind = %delta.kind(), %rejection, "delta rejected");
                None
            }
        }
    }

    fn add_delta<'a>(
        &'a self,
        ctx: &'a WorkerContext<'_>,
        delta: &StorageDelta,
    ) -> Result<(Option<BaseGuard<'a>>, DeltaRecord), Rejection> {
        match delta {
            StorageDelta::DeleteLast => Ok((None, DeltaRecord::DeleteLast)),

            StorageDelta::RawMemoryWrite(bytes) => {
                let base = self
                    .base
                    .try_set(ctx, StorageObject::RawMemory(bytes.clone()))?;
                Ok((Some(base), DeltaRecord::RawMemoryWrite))
            }

            &StorageDelta::NonnegativeInt64SetAdd { set_value, delta } => {
                let base = self
                    .base
                    .try_set(ctx, StorageObject::NonnegativeInt64(set_value))?;
                if delta < 0 {
                    self.total_subtracted
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                            let next = current.checked_add(delta)?;
                            (i128::from(set_value) + i128::from(next) >= 0).then_some(next)
                        })
                        .map_err(|_| Rejection::Negative)?;
                    Ok((Some(base), DeltaRecord::Subtracted(delta)))
                } else {
                    let amount = delta as u64;
                    self.total_added
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                            Some(current.saturating_add(amount))
                        })
                        .ok();
                    Ok((Some(base), DeltaRecord::Added(amount)))
                }
            }

            &StorageDelta::HashSetIncreaseLimit { amount } => {
                let base = self
                    .base
                    .try_set(ctx, StorageObject::hash_set_placeholder())?;
                self.size_increase
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        Some(current.saturating_add(amount))
                    })
                    .ok();
                Ok((Some(base), DeltaRecord::SizeIncrease(amount)))
            }

            &StorageDelta::HashSetInsert { entry } => {
                let base = self
                    .base
                    .try_set(ctx, StorageObject::hash_set_placeholder())?;
                self.insert_hash(ctx, entry)?;
                Ok((Some(base), DeltaRecord::Insert(entry)))
            }

            &StorageDelta::HashSetClear { threshold } => {
                let base = self
                    .base
                    .try_set(ctx, StorageObject::hash_set_placeholder())?;
                Ok((Some(base), DeltaRecord::Clear(threshold)))
            }

            &StorageDelta::AssetAdd { delta } => {
                let base = self.base.try_set(ctx, StorageObject::asset_placeholder())?;
                if delta < 0 {
                    let amount = delta.unsigned_abs();
                    self.available_asset
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                            current.checked_sub(amount)
                        })
                        .map_err(|_| Rejection::Negative)?;
                    Ok((Some(base), DeltaRecord::AssetDecrease(amount)))
                } else {
                    let amount = delta as u64;
                    self.available_asset_upperbound
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                            current.checked_add(amount)
                        })
                        .map_err(|_| Rejection::Overflow)?;
                    Ok((Some(base), DeltaRecord::AssetIncrease(amount)))
                }
            }

            StorageDelta::DeleteFirst => {
                panic!("delete_first deltas have no execution path")
            }
        }
    }

    fn insert_hash(&self, ctx: &WorkerContext<'_>, entry: HashSetEntry) -> Result<(), Rejection> {
        let (committed_len, committed_max) = self
            .committed_hash_set()
            .map(|set| (set.len() as u64, set.max_size))
            .unwrap_or((0, 0));

        if self
            .committed_hash_set()
            .is_some_and(|set| set.contains_hash(&entry.hash))
        {
            return Err(Rejection::DuplicateHash);
        }

        let limit = committed_max
            .saturating_add(self.committed_size_increase.load(Ordering::Acquire))
            .min(HASH_SET_MAX_SIZE);
        self.num_new_elts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (committed_len + pending < limit).then_some(pending + 1)
            })
            .map_err(|_| Rejection::CapacityExceeded)?;

        self.new_hashes.insert(ctx, entry).inspect_err(|_| {
            self.num_new_elts.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Counts a delta whose transaction became durable.
    fn commit_delta(&self, record: DeltaRecord) {
        match record {
            DeltaRecord::DeleteLast => {
                self.delete_last_committed.store(true, Ordering::Release);
            }
            DeltaRecord::Clear(threshold) => {
                self.max_committed_clear_threshold
                    .fetch_max(threshold, Ordering::AcqRel);
                self.hashset_clear_committed.store(true, Ordering::Release);
            }
            // A committed debit now also bounds the best case from above,
            // and a committed credit raises the worst case.
            DeltaRecord::AssetDecrease(amount) => {
                self.available_asset_upperbound
                    .fetch_sub(amount, Ordering::AcqRel);
            }
            DeltaRecord::AssetIncrease(amount) => {
                self.available_asset.fetch_add(amount, Ordering::AcqRel);
            }
            DeltaRecord::SizeIncrease(amount) => {
                self.committed_size_increase
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        Some(current.saturating_add(amount))
                    })
                    .ok();
            }
            DeltaRecord::RawMemoryWrite
            | DeltaRecord::Added(_)
            | DeltaRecord::Subtracted(_)
            | DeltaRecord::Insert(_) => {}
        }
    }

    /// Undoes the bookkeeping of a delta whose transaction was dropped.
    fn revert_delta(&self, ctx: &WorkerContext<'_>, record: DeltaRecord) {
        match record {
            DeltaRecord::Added(amount) => {
                self.total_added
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        Some(current.saturating_sub(amount))
                    })
                    .ok();
            }
            DeltaRecord::Subtracted(delta) => {
                self.total_subtracted.fetch_sub(delta, Ordering::AcqRel);
            }
            DeltaRecord::SizeIncrease(amount) => {
                self.size_increase
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        Some(current.saturating_sub(amount))
                    })
                    .ok();
            }
            DeltaRecord::Insert(entry) => {
                self.new_hashes.erase(ctx, entry);
                self.num_new_elts.fetch_sub(1, Ordering::AcqRel);
            }
            DeltaRecord::AssetDecrease(amount) => {
                self.available_asset.fetch_add(amount, Ordering::AcqRel);
            }
            DeltaRecord::AssetIncrease(amount) => {
                self.available_asset_upperbound
                    .fetch_sub(amount, Ordering::AcqRel);
            }
            DeltaRecord::RawMemoryWrite | DeltaRecord::Clear(_) | DeltaRecord::DeleteLast => {}
        }
    }

    /// Folds the round's committed deltas into the durable value.
    ///
    /// `arena` must be the round's hash arena, not yet reset.
    ///
    /// # Panics
    ///
    /// Panics if the asset bounds disagree, which means some delta was
    /// neither committed nor reverted or the accounting is broken.
    pub fn commit_round(&mut self, arena: &HashArena) {
        let value = self.base.commit_round_and_reset();

        // Checked before the empty case: a delete never writes the base slot.
        if *self.delete_last_committed.get_mut() {
            self.committed_base = None;
            self.base.clear_required_type();
            self.clear_mods();
            return;
        }

        let Some(value) = value else {
            self.clear_mods();
            return;
        };

        let next = match value {
            StorageObject::RawMemory(_) => value,
            StorageObject::NonnegativeInt64(set_value) => {
                let added = set_value.saturating_add(*self.total_added.get_mut());
                StorageObject::NonnegativeInt64(
                    added.saturating_add_signed(*self.total_subtracted.get_mut()),
                )
            }
            StorageObject::HashSet(_) => StorageObject::HashSet(self.fold_hash_set(arena)),
            StorageObject::KnownSupplyAsset(_) => {
                let lower = *self.available_asset.get_mut();
                let upper = *self.available_asset_upperbound.get_mut();
                assert_eq!(
                    lower, upper,
                    "asset bounds diverged at round commit (lower {lower}, upper {upper})"
                );
                StorageObject::KnownSupplyAsset(lower)
            }
        };

        self.committed_base = Some(next);
        self.clear_mods();
    }

    fn fold_hash_set(&mut self, arena: &HashArena) -> HashSetValue {
        let mut set = match self.committed_base.take() {
            Some(StorageObject::HashSet(set)) => set,
            _ => HashSetValue::default(),
        };
        let growth = *self.committed_size_increase.get_mut();
        debug_assert_eq!(
            growth,
            *self.size_increase.get_mut(),
            "a limit increase was neither committed nor reverted"
        );
        set.max_size = set
            .max_size
            .saturating_add(growth)
            .min(HASH_SET_MAX_SIZE);
        set.entries.extend(self.new_hashes.get_hashes(arena));
        set.normalize();
        if *self.hashset_clear_committed.get_mut() {
            set.clear_up_to(*self.max_committed_clear_threshold.get_mut());
        }
        set
    }

    /// Discards the round without touching the committed value.
    pub fn rewind_round(&mut self) {
        self.base.rewind_round();
        self.clear_mods();
    }

    /// Resets every per-round accumulator from the committed value.
    fn clear_mods(&mut self) {
        *self.total_added.get_mut() = 0;
        *self.total_subtracted.get_mut() = 0;
        *self.size_increase.get_mut() = 0;
        *self.committed_size_increase.get_mut() = 0;
        *self.num_new_elts.get_mut() = 0;
        *self.hashset_clear_committed.get_mut() = false;
        *self.max_committed_clear_threshold.get_mut() = 0;
        *self.delete_last_committed.get_mut() = false;

        let asset = self.committed_asset();
        *self.available_asset.get_mut() = asset;
        *self.available_asset_upperbound.get_mut() = asset;

        // Only keys that are, or may become, hash sets need pending room.
        let pending_room = match &self.committed_base {
            None => HASH_SET_MAX_SIZE,
            Some(StorageObject::HashSet(set)) => {
                HASH_SET_MAX_SIZE.saturating_sub(set.len() as u64)
            }
            Some(_) => 0,
        };
        self.new_hashes.resize(pending_room as usize);
    }
}

/// Reversion handle for one accepted delta.
///
/// Holds the base-slot guard together with the delta's bookkeeping record.
/// Dropping it without [`DeltaGuard::commit`] undoes the delta completely.
#[must_use = "dropping the guard reverts the delta"]
pub struct DeltaGuard<'a> {
    object: &'a RevertableObject,
    ctx: &'a WorkerContext<'a>,
    base: Option<BaseGuard<'a>>,
    record: DeltaRecord,
    finished: bool,
}

impl DeltaGuard<'_> {
    /// Makes the delta durable for this round.
    pub fn commit(mut self) {
        self.object.commit_delta(self.record);
        if let Some(base) = self.base.take() {
            base.commit();
        }
        self.finished = true;
    }

    /// Undoes the delta. Equivalent to dropping the guard.
    pub fn revert(self) {
        drop(self);
    }
}

impl Drop for DeltaGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.object.revert_delta(self.ctx, self.record);
            // The base guard drops after this and releases its hold.
        }
    }
}

impl std::fmt::Debug for DeltaGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaGuard")
            .field("record", &self.record)
            .field("finished", &self.finished)
            .finish()
    }
}
