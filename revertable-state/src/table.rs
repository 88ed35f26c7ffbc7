//! Concurrent registry of the per-key objects touched in a round.

use crate::context::HashArena;
use crate::object::RevertableObject;
use crate::types::StorageObject;
use alloy_primitives::B256;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// A change to durable state produced by [`ObjectTable::commit_round`].
/// `None` means the key was deleted.
pub type StateChange = (B256, Option<StorageObject>);

/// Key → [`RevertableObject`] map shared by all workers of a round.
///
/// Objects are created on first touch and seeded with the key's committed
/// value. Workers hold `Arc`s to objects only while executing; all of them
/// must be dropped before the round is committed or rewound.
#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: DashMap<B256, Arc<RevertableObject>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the object for `key`, creating it from `committed` if this is
    /// the first touch. `committed` is not called otherwise.
    pub fn get_or_create(
        &self,
        key: B256,
        committed: impl FnOnce() -> Option<StorageObject>,
    ) -> Arc<RevertableObject> {
        if let Some(existing) = self.objects.get(&key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .objects
            .entry(key)
            .or_insert_with(|| Arc::new(RevertableObject::new(committed())));
        Arc::clone(entry.value())
    }

    pub fn get(&self, key: &B256) -> Option<Arc<RevertableObject>> {
        self.objects.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the committed value of `key`.
    pub fn committed(&self, key: &B256) -> Option<StorageObject> {
        self.objects
            .get(key)
            .and_then(|entry| entry.value().committed().cloned())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn object_mut<'a>(key: &B256, object: &'a mut Arc<RevertableObject>) -> &'a mut RevertableObject {
        match Arc::get_mut(object) {
            Some(object) => object,
            None => panic!("object {key} is still referenced at round end"),
        }
    }

    /// Folds every object's round into its committed value.
    ///
    /// Returns the keys whose committed value changed, sorted by key.
    /// Objects left without a committed value are dropped from the table.
    ///
    /// # Panics
    ///
    /// Panics if any worker still holds an object, or if an object's own
    /// commit check fails.
    pub fn commit_round(&mut self, arena: &HashArena) -> Vec<StateChange> {
        let mut changes = Vec::new();
        for mut entry in self.objects.iter_mut() {
            let key = *entry.key();
            let object = Self::object_mut(&key, entry.value_mut());
            let before = object.committed().cloned();
            object.commit_round(arena);
            let after = object.committed();
            if before.as_ref() != after {
                changes.push((key, after.cloned()));
            }
        }
        self.objects.retain(|_, object| object.committed().is_some());
        changes.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        debug!(
            changed = changes.len(),
            live = self.objects.len(),
            "committed round"
        );
        changes
    }

    /// Discards the round on every object.
    pub fn rewind_round(&mut self) {
        for mut entry in self.objects.iter_mut() {
            let key = *entry.key();
            Self::object_mut(&key, entry.value_mut()).rewind_round();
        }
        self.objects.retain(|_, object| object.committed().is_some());
        debug!(live = self.objects.len(), "rewound round");
    }
}
