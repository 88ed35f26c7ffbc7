//! Single-slot speculative value holder with optimistic "set or join".
//!
//! Writers proposing the same value as the one in place all succeed and share
//! it; a writer proposing a different value is rejected. Every accepted write
//! can be reverted until it is committed (finalized).
//!
//! State is a tag word plus a separately published value pointer:
//!
//! ```text
//! tag: | generation: 48 | in-flight: 8 | reserved: 6 | draining: 1 | finalized: 1 |
//! ```
//!
//! One CAS on the tag covers every field. Every transition out of a
//! non-empty tag draws a fresh generation id. The empty tag is always zero and
//! does recur, so a writer may win a CAS against an empty tag it observed
//! before other writers came and went. That is only sound if the pointer is
//! already null whenever the tag reads empty, so the last revert runs in three
//! steps:
//!
//! 1. CAS the tag to a fresh *draining* tag (non-empty, no in-flight writers);
//! 2. unpublish the pointer and retire the value;
//! 3. store the empty tag.
//!
//! A writer that finds a draining tag waits for step 3. Publishing on set uses
//! a CAS from null, after the tag CAS. A reader can still observe a nonzero tag
//! with a null pointer; such a torn snapshot is never acted on, the reader
//! spins and reloads.
//!
//! Retired values go to `crossbeam-epoch`; readers pin the epoch before
//! dereferencing the pointer, so a value is never freed under a reader.

use crate::context::WorkerContext;
use crate::error::Rejection;
use crate::types::{ObjectType, StorageObject};
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};

const FINALIZED_BIT: u64 = 1;
const DRAINING_BIT: u64 = 1 << 1;
const INFLIGHT_SHIFT: u32 = 8;
const GENERATION_SHIFT: u32 = 16;
const GENERATION_MASK: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag(u64);

impl Tag {
    const EMPTY: Tag = Tag(0);

    fn new(generation: u64, inflight: u8) -> Self {
        Tag(((generation & GENERATION_MASK) << GENERATION_SHIFT)
            | (u64::from(inflight) << INFLIGHT_SHIFT))
    }

    /// Tag held by a last revert while it unpublishes the value.
    fn draining(generation: u64) -> Self {
        Tag(Tag::new(generation, 0).0 | DRAINING_BIT)
    }

    fn is_draining(self) -> bool {
        self.0 & DRAINING_BIT != 0
    }

    fn is_empty(self) -> bool {
        self == Tag::EMPTY
    }

    fn inflight(self) -> u8 {
        (self.0 >> INFLIGHT_SHIFT) as u8
    }

    fn is_finalized(self) -> bool {
        self.0 & FINALIZED_BIT != 0
    }
}

/// Atomic holder of one key's speculative value for a round.
#[derive(Debug)]
pub struct RevertableBaseObject {
    tag: AtomicU64,
    value: Atomic<StorageObject>,
    required_type: Option<ObjectType>,
}

impl RevertableBaseObject {
    pub fn new(required_type: Option<ObjectType>) -> Self {
        Self {
            tag: AtomicU64::new(0),
            value: Atomic::null(),
            required_type,
        }
    }

    pub fn required_type(&self) -> Option<ObjectType> {
        self.required_type
    }

    /// Proposes `candidate` as this round's value.
    ///
    /// Succeeds if the slot is empty or already holds an equal value. The
    /// returned guard reverts the write on drop unless committed.
    pub fn try_set<'a>(
        &'a self,
        ctx: &'a WorkerContext<'_>,
        candidate: StorageObject,
    ) -> Result<BaseGuard<'a>, Rejection> {
        if let Some(required) = self.required_type {
            let found = candidate.object_type();
            if found != required {
                return Err(Rejection::TypeMismatch { required, found });
            }
        }

        let mut candidate = Owned::new(candidate);
        let guard = epoch::pin();
        let backoff = Backoff::new();
        loop {
            let tag = Tag(self.tag.load(Ordering::Acquire));
            let current = self.value.load(Ordering::Acquire, &guard);
            if tag.is_empty() != current.is_null() || tag.is_draining() {
                backoff.spin();
                continue;
            }

            // SAFETY: the epoch is pinned, and values are only destroyed
            // through `defer_destroy` or under `&mut self`.
            match unsafe { current.as_ref() } {
                None => match self.try_install(tag, ctx, candidate, &guard) {
                    Ok(()) => return Ok(BaseGuard::in_flight(self, ctx)),
                    Err(returned) => {
                        candidate = returned;
                        backoff.spin();
                    }
                },
                Some(existing) => {
                    if *existing != *candidate {
                        return Err(Rejection::ValueMismatch);
                    }
                    if tag.is_finalized() {
                        return Ok(BaseGuard::finalized());
                    }
                    let inflight = tag.inflight().checked_add(1).ok_or(Rejection::WriterLimit)?;
                    let next = Tag::new(ctx.next_id(), inflight);
                    if self
                        .tag
                        .compare_exchange(tag.0, next.0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(BaseGuard::in_flight(self, ctx));
                    }
                    backoff.spin();
                }
            }
        }
    }

    /// Claims the slot from the empty tag `observed` and publishes `candidate`.
    ///
    /// Hands the candidate back if the tag moved on.
    fn try_install(
        &self,
        observed: Tag,
        ctx: &WorkerContext<'_>,
        candidate: Owned<StorageObject>,
        guard: &Guard,
    ) -> Result<(), Owned<StorageObject>> {
        debug_assert!(observed.is_empty());
        let next = Tag::new(ctx.next_id(), 1);
        if self
            .tag
            .compare_exchange(observed.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(candidate);
        }
        // The empty tag is only stored once the pointer is null.
        let published = self.value.compare_exchange(
            Shared::null(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        );
        assert!(published.is_ok(), "empty base slot still holds a value");
        Ok(())
    }

    /// Marks the current value durable for the rest of the round.
    pub fn commit(&self) {
        self.tag.fetch_or(FINALIZED_BIT, Ordering::AcqRel);
    }

    /// Releases one in-flight hold on the current value.
    ///
    /// The last release empties the slot and retires the value. A finalized
    /// slot ignores reverts.
    pub fn revert(&self, ctx: &WorkerContext<'_>) {
        let guard = epoch::pin();
        let backoff = Backoff::new();
        loop {
            let tag = Tag(self.tag.load(Ordering::Acquire));
            let current = self.value.load(Ordering::Acquire, &guard);
            if tag.is_empty() != current.is_null() {
                backoff.spin();
                continue;
            }
            if tag.is_finalized() {
                return;
            }
            assert!(tag.inflight() > 0, "revert without an in-flight writer");

            let next = match tag.inflight() {
                1 => Tag::draining(ctx.next_id()),
                inflight => Tag::new(ctx.next_id(), inflight - 1),
            };
            if self
                .tag
                .compare_exchange(tag.0, next.0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            if next.is_draining() {
                let retired = self.value.swap(Shared::null(), Ordering::AcqRel, &guard);
                // SAFETY: the slot no longer references `retired`; readers
                // that loaded it are pinned and keep it alive until they unpin.
                unsafe { guard.defer_destroy(retired) };
                self.tag.store(Tag::EMPTY.0, Ordering::Release);
            }
            return;
        }
    }

    /// Whether a speculative value is currently in place. May be stale.
    pub fn is_set(&self) -> bool {
        !Tag(self.tag.load(Ordering::Acquire)).is_empty()
    }

    /// Whether the current value has been finalized. May be stale.
    pub fn is_finalized(&self) -> bool {
        Tag(self.tag.load(Ordering::Acquire)).is_finalized()
    }

    fn take_value(&mut self) -> Option<(Tag, StorageObject)> {
        let tag = Tag(std::mem::take(self.tag.get_mut()));
        // SAFETY: `&mut self` rules out every concurrent reader and guard.
        unsafe {
            let current = self
                .value
                .swap(Shared::null(), Ordering::Relaxed, epoch::unprotected());
            (!current.is_null()).then(|| (tag, *current.into_owned().into_box()))
        }
    }

    /// Takes the round's finalized value and resets the slot.
    ///
    /// A taken value fixes the required type for every later round.
    pub fn commit_round_and_reset(&mut self) -> Option<StorageObject> {
        let (tag, value) = self.take_value()?;
        if !tag.is_finalized() {
            tracing::warn!("discarding unfinalized speculative value at round commit");
            return None;
        }
        self.required_type = Some(value.object_type());
        Some(value)
    }

    /// Discards any value left over from the round.
    pub fn rewind_round(&mut self) {
        self.take_value();
    }

    /// Lifts the required type, after the key was deleted.
    pub fn clear_required_type(&mut self) {
        self.required_type = None;
    }
}

impl Drop for RevertableBaseObject {
    fn drop(&mut self) {
        self.take_value();
    }
}

/// Reversion handle for one accepted [`RevertableBaseObject::try_set`].
///
/// Dropping the guard without calling [`BaseGuard::commit`] reverts the write.
#[must_use = "dropping the guard reverts the write"]
pub struct BaseGuard<'a> {
    held: Option<(&'a RevertableBaseObject, &'a WorkerContext<'a>)>,
}

impl<'a> BaseGuard<'a> {
    fn in_flight(object: &'a RevertableBaseObject, ctx: &'a WorkerContext<'a>) -> Self {
        Self {
            held: Some((object, ctx)),
        }
    }

    /// A join on an already finalized value: nothing to undo.
    fn finalized() -> Self {
        Self { held: None }
    }

    pub fn commit(mut self) {
        if let Some((object, _)) = self.held.take() {
            object.commit();
        }
    }

    pub fn revert(self) {
        drop(self);
    }
}

impl Drop for BaseGuard<'_> {
    fn drop(&mut self) {
        if let Some((object, ctx)) = self.held.take() {
            object.revert(ctx);
        }
    }
}

impl std::fmt::Debug for BaseGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseGuard")
            .field("armed", &self.held.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoundContext;
    use std::sync::atomic::AtomicUsize;

    fn raw(bytes: &[u8]) -> StorageObject {
        StorageObject::RawMemory(bytes.to_vec())
    }

    #[test]
    fn test_tag_packing() {
        let tag = Tag::new(0xABCD, 3);
        assert_eq!(tag.inflight(), 3);
        assert!(!tag.is_finalized());
        assert!(!tag.is_empty());
        assert!(Tag(tag.0 | FINALIZED_BIT).is_finalized());

        let draining = Tag::draining(0);
        assert!(draining.is_draining());
        assert!(!draining.is_empty());
        assert_eq!(draining.inflight(), 0);
        assert!(!tag.is_draining());
    }

    #[test]
    fn test_equal_values_join() {
        let round = RoundContext::new(1);
        let ctx = round.worker(0);
        let mut slot = RevertableBaseObject::new(None);

        let first = slot.try_set(&ctx, raw(b"a")).expect("empty slot accepts");
        let second = slot.try_set(&ctx, raw(b"a")).expect("equal value joins");
        assert!(slot.try_set(&ctx, raw(b"b")).is_err());

        first.commit();
        second.commit();
        assert_eq!(slot.commit_round_and_reset(), Some(raw(b"a")));
        assert_eq!(slot.required_type(), Some(ObjectType::RawMemory));
    }

    #[test]
    fn test_revert_empties_slot() {
        let round = RoundContext::new(1);
        let ctx = round.worker(0);
        let mut slot = RevertableBaseObject::new(None);

        let first = slot.try_set(&ctx, raw(b"a")).unwrap();
        let second = slot.try_set(&ctx, raw(b"a")).unwrap();
        second.revert();
        assert!(slot.is_set());
        first.revert();
        assert!(!slot.is_set());

        // Once empty, a different value is accepted.
        slot.try_set(&ctx, raw(b"b")).unwrap().commit();
        assert_eq!(slot.commit_round_and_reset(), Some(raw(b"b")));
    }

    #[test]
    fn test_finalized_join_is_noop_guard() {
        let round = RoundContext::new(1);
        let ctx = round.worker(0);
        let mut slot = RevertableBaseObject::new(None);

        slot.try_set(&ctx, raw(b"a")).unwrap().commit();
        assert!(slot.is_finalized());

        // Dropping a guard on a finalized value leaves it in place.
        drop(slot.try_set(&ctx, raw(b"a")).unwrap());
        assert!(slot.is_set());
        assert_eq!(slot.commit_round_and_reset(), Some(raw(b"a")));
    }

    #[test]
    fn test_required_type_rejects_mismatch() {
        let round = RoundContext::new(1);
        let ctx = round.worker(0);
        let slot = RevertableBaseObject::new(Some(ObjectType::NonnegativeInt64));

        let err = slot.try_set(&ctx, raw(b"a")).unwrap_err();
        assert_eq!(
            err,
            Rejection::TypeMismatch {
                required: ObjectType::NonnegativeInt64,
                found: ObjectType::RawMemory,
            }
        );
        assert!(!slot.is_set());
    }

    #[test]
    fn test_rewind_discards_and_keeps_type() {
        let round = RoundContext::new(1);
        let ctx = round.worker(0);
        let mut slot = RevertableBaseObject::new(Some(ObjectType::RawMemory));

        slot.try_set(&ctx, raw(b"a")).unwrap().commit();
        slot.rewind_round();
        assert!(!slot.is_set());
        assert_eq!(slot.required_type(), Some(ObjectType::RawMemory));
        assert_eq!(slot.commit_round_and_reset(), None);
    }

    #[test]
    fn test_concurrent_writers_of_same_value() {
        let round = RoundContext::new(8);
        let mut slot = RevertableBaseObject::new(None);
        let accepted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for worker in 0..8 {
                let ctx = round.worker(worker);
                let slot = &slot;
                let accepted = &accepted;
                s.spawn(move || {
                    for _ in 0..200 {
                        if let Ok(guard) = slot.try_set(&ctx, raw(b"same")) {
                            accepted.fetch_add(1, Ordering::Relaxed);
                            guard.revert();
                        }
                    }
                });
            }
        });

        assert_eq!(accepted.load(Ordering::Relaxed), 8 * 200);
        assert!(!slot.is_set());
        assert_eq!(slot.commit_round_and_reset(), None);
    }

    #[test]
    fn test_stale_empty_snapshot_lands_on_cleared_slot() {
        let round = RoundContext::new(2);
        let (late, other) = (round.worker(0), round.worker(1));
        let mut slot = RevertableBaseObject::new(None);
        let guard = epoch::pin();

        // The late writer observes an empty slot...
        let stale = Tag(slot.tag.load(Ordering::Acquire));
        assert!(stale.is_empty());
        assert!(slot.value.load(Ordering::Acquire, &guard).is_null());

        // ...while another writer sets and fully reverts a different value.
        slot.try_set(&other, raw(b"other")).unwrap().revert();
        assert!(Tag(slot.tag.load(Ordering::Acquire)).is_empty());
        assert!(slot.value.load(Ordering::Acquire, &guard).is_null());

        // The recycled empty tag lets the late CAS through, onto a null pointer.
        assert!(slot
            .try_install(stale, &late, Owned::new(raw(b"late")), &guard)
            .is_ok());
        let installed = BaseGuard::in_flight(&slot, &late);
        drop(guard);

        assert_eq!(
            slot.try_set(&other, raw(b"other")).unwrap_err(),
            Rejection::ValueMismatch
        );
        slot.try_set(&other, raw(b"late")).unwrap().commit();
        installed.commit();
        assert_eq!(slot.commit_round_and_reset(), Some(raw(b"late")));
    }

    #[test]
    fn test_writer_waits_out_a_draining_slot() {
        let round = RoundContext::new(2);
        let (owner, waiter) = (round.worker(0), round.worker(1));
        let mut slot = RevertableBaseObject::new(None);

        // Freeze the slot between the draining CAS and the unpublish.
        slot.tag
            .store(Tag::draining(owner.next_id()).0, Ordering::Release);
        slot.value.store(Owned::new(raw(b"a")), Ordering::Release);

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|s| {
            let slot = &slot;
            s.spawn(move || {
                let guard = slot.try_set(&waiter, raw(b"a")).unwrap();
                tx.send(()).unwrap();
                guard.commit();
            });

            // A draining value must not be joined.
            assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());

            let guard = epoch::pin();
            let retired = slot.value.swap(Shared::null(), Ordering::AcqRel, &guard);
            unsafe { guard.defer_destroy(retired) };
            slot.tag.store(Tag::EMPTY.0, Ordering::Release);

            rx.recv().unwrap();
        });

        // The waiter installed its own copy rather than the retired one.
        assert_eq!(slot.commit_round_and_reset(), Some(raw(b"a")));
    }

    #[test]
    fn test_conflicting_set_and_revert_never_wedges() {
        let round = RoundContext::new(4);
        let mut slot = RevertableBaseObject::new(None);

        std::thread::scope(|s| {
            for worker in 0..4u8 {
                let ctx = round.worker(worker as usize);
                let slot = &slot;
                s.spawn(move || {
                    for _ in 0..500 {
                        if let Ok(guard) = slot.try_set(&ctx, raw(&[worker])) {
                            guard.revert();
                        }
                    }
                });
            }
        });

        assert!(!slot.is_set());
        let ctx = round.worker(0);
        slot.try_set(&ctx, raw(b"after")).unwrap().commit();
        assert_eq!(slot.commit_round_and_reset(), Some(raw(b"after")));
    }

    #[test]
    fn test_concurrent_conflicting_writers() {
        let round = RoundContext::new(4);
        let slot = RevertableBaseObject::new(None);
        let winners = parking_lot::Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for worker in 0..4u8 {
                let ctx = round.worker(worker as usize);
                let slot = &slot;
                let winners = &winners;
                s.spawn(move || {
                    if let Ok(guard) = slot.try_set(&ctx, raw(&[worker])) {
                        guard.commit();
                        winners.lock().push(worker);
                    }
                });
            }
        });

        assert_eq!(winners.into_inner().len(), 1);
    }
}
