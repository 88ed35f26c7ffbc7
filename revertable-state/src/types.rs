//! Core value and delta types for speculative state updates.

use alloy_primitives::B256;
use std::fmt;

/// Hard cap on the number of entries a hash set may ever hold.
pub const HASH_SET_MAX_SIZE: u64 = 64;

/// The type tag of a [`StorageObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    RawMemory,
    NonnegativeInt64,
    HashSet,
    KnownSupplyAsset,
}

/// An entry of a hash-set value.
///
/// Entries sort by `index` first, then by `hash`, which gives committed sets a
/// deterministic layout regardless of insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashSetEntry {
    pub index: u64,
    pub hash: B256,
}

impl HashSetEntry {
    pub fn new(hash: B256, index: u64) -> Self {
        Self { index, hash }
    }
}

/// A committed hash set: its entries plus the current size limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashSetValue {
    pub entries: Vec<HashSetEntry>,
    pub max_size: u64,
}

impl HashSetValue {
    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            entries: Vec::new(),
            max_size: max_size.min(HASH_SET_MAX_SIZE),
        }
    }

    /// Linear scan for an entry with the given hash.
    pub fn contains_hash(&self, hash: &B256) -> bool {
        self.entries.iter().any(|entry| entry.hash == *hash)
    }

    /// Sorts entries into canonical order.
    pub fn normalize(&mut self) {
        self.entries.sort_unstable();
    }

    /// Drops every entry whose index is at or below `threshold`.
    pub fn clear_up_to(&mut self, threshold: u64) {
        self.entries.retain(|entry| entry.index > threshold);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A value stored under a key.
///
/// Values are immutable once published: every change builds a new object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageObject {
    RawMemory(Vec<u8>),
    NonnegativeInt64(u64),
    HashSet(HashSetValue),
    KnownSupplyAsset(u64),
}

impl StorageObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            StorageObject::RawMemory(_) => ObjectType::RawMemory,
            StorageObject::NonnegativeInt64(_) => ObjectType::NonnegativeInt64,
            StorageObject::HashSet(_) => ObjectType::HashSet,
            StorageObject::KnownSupplyAsset(_) => ObjectType::KnownSupplyAsset,
        }
    }

    /// The value every hash-set delta proposes to the base slot.
    ///
    /// All hash-set deltas on a key join on this placeholder; the real
    /// contents are folded in from the per-key accumulators at commit.
    pub fn hash_set_placeholder() -> Self {
        StorageObject::HashSet(HashSetValue::default())
    }

    /// The value every asset delta proposes to the base slot.
    pub fn asset_placeholder() -> Self {
        StorageObject::KnownSupplyAsset(0)
    }
}

/// A single proposed operation against one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StorageDelta {
    RawMemoryWrite(Vec<u8>),
    NonnegativeInt64SetAdd { set_value: u64, delta: i64 },
    HashSetIncreaseLimit { amount: u64 },
    HashSetInsert { entry: HashSetEntry },
    HashSetClear { threshold: u64 },
    AssetAdd { delta: i64 },
    DeleteLast,
    DeleteFirst,
}

impl StorageDelta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            StorageDelta::RawMemoryWrite(_) => DeltaKind::RawMemoryWrite,
            StorageDelta::NonnegativeInt64SetAdd { .. } => DeltaKind::NonnegativeInt64SetAdd,
            StorageDelta::HashSetIncreaseLimit { .. } => DeltaKind::HashSetIncreaseLimit,
            StorageDelta::HashSetInsert { .. } => DeltaKind::HashSetInsert,
            StorageDelta::HashSetClear { .. } => DeltaKind::HashSetClear,
            StorageDelta::AssetAdd { .. } => DeltaKind::AssetAdd,
            StorageDelta::DeleteLast => DeltaKind::DeleteLast,
            StorageDelta::DeleteFirst => DeltaKind::DeleteFirst,
        }
    }
}

/// Fieldless discriminant of a [`StorageDelta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    RawMemoryWrite,
    NonnegativeInt64SetAdd,
    HashSetIncreaseLimit,
    HashSetInsert,
    HashSetClear,
    AssetAdd,
    DeleteLast,
    DeleteFirst,
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeltaKind::RawMemoryWrite => "raw_memory_write",
            DeltaKind::NonnegativeInt64SetAdd => "nonnegative_int64_set_add",
            DeltaKind::HashSetIncreaseLimit => "hash_set_increase_limit",
            DeltaKind::HashSetInsert => "hash_set_insert",
            DeltaKind::HashSetClear => "hash_set_clear",
            DeltaKind::AssetAdd => "asset_add",
            DeltaKind::DeleteLast => "delete_last",
            DeltaKind::DeleteFirst => "delete_first",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8, index: u64) -> HashSetEntry {
        HashSetEntry::new(B256::repeat_byte(byte), index)
    }

    #[test]
    fn test_entries_order_by_index_then_hash() {
        let mut set = HashSetValue::with_max_size(8);
        set.entries = vec![entry(3, 2), entry(1, 5), entry(2, 2)];
        set.normalize();

        assert_eq!(set.entries, vec![entry(2, 2), entry(3, 2), entry(1, 5)]);
    }

    #[test]
    fn test_clear_up_to_threshold() {
        let mut set = HashSetValue::with_max_size(8);
        set.entries = vec![entry(1, 1), entry(2, 2), entry(3, 3)];
        set.clear_up_to(2);

        assert_eq!(set.entries, vec![entry(3, 3)]);
        assert!(set.contains_hash(&B256::repeat_byte(3)));
        assert!(!set.contains_hash(&B256::repeat_byte(1)));
    }

    #[test]
    fn test_max_size_is_capped() {
        let set = HashSetValue::with_max_size(HASH_SET_MAX_SIZE + 100);
        assert_eq!(set.max_size, HASH_SET_MAX_SIZE);
    }

    #[test]
    fn test_delta_kinds() {
        assert_eq!(StorageDelta::DeleteLast.kind(), DeltaKind::DeleteLast);
        assert_eq!(
            StorageDelta::AssetAdd { delta: -1 }.kind(),
            DeltaKind::AssetAdd
        );
        assert_eq!(DeltaKind::HashSetInsert.to_string(), "hash_set_insert");
    }
}
