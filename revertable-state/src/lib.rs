//! Speculative state-update engine for parallel transaction execution.
//!
//! Worker threads tentatively apply conflicting writes to shared keyed state
//! during a round, conflicts are resolved deterministically, and at round end
//! the surviving writes are folded into durable state (or everything is
//! discarded).
//!
//! # Core Components
//!
//! - **RevertableBaseObject**: single-slot "set or join" holder with a packed
//!   generation/in-flight/finalized tag and epoch-deferred reclamation
//! - **RevertableObject**: per-key aggregate implementing the delta kinds on
//!   top of the base slot
//! - **AtomicSet**: lock-free open-addressed set used for pending hash-set
//!   inserts
//! - **Mempool**: bounded ring buffer feeding transactions to workers
//! - **DeltaPriority**: deterministic total order over `(delta, priority)`
//!
//! # Round Lifecycle
//!
//! 1. Each worker gets a [`WorkerContext`] from the round's [`RoundContext`]
//! 2. For every key a transaction touches, the worker calls
//!    [`RevertableObject::try_add_delta`] and keeps the returned guard
//! 3. If every delta was accepted the guards are committed, otherwise they are
//!    dropped, which reverts them
//! 4. Once all workers are done, [`ObjectTable::commit_round`] (or
//!    `rewind_round`) finalizes the round and [`RoundContext::reset`] clears
//!    the short-hash arena
//!
//! # Example
//!
//! ```rust
//! use revertable_state::{ObjectTable, RoundContext, StorageDelta, StorageObject};
//! use alloy_primitives::B256;
//!
//! let mut table = ObjectTable::new();
//! let round = RoundContext::new(1);
//! let key = B256::repeat_byte(1);
//!
//! {
//!     let ctx = round.worker(0);
//!     let object = table.get_or_create(key, || Some(StorageObject::NonnegativeInt64(10)));
//!     let delta = StorageDelta::NonnegativeInt64SetAdd { set_value: 10, delta: -4 };
//!     if let Some(guard) = object.try_add_delta(&ctx, &delta) {
//!         guard.commit();
//!     }
//! }
//!
//! let changes = table.commit_round(round.arena());
//! assert_eq!(changes, vec![(key, Some(StorageObject::NonnegativeInt64(6)))]);
//! ```

pub mod atomic_set;
pub mod base_object;
pub mod context;
pub mod error;
pub mod mempool;
pub mod object;
pub mod priority;
pub mod table;
pub mod types;

pub use atomic_set::{AtomicSet, TOMBSTONE};
pub use base_object::{BaseGuard, RevertableBaseObject};
pub use context::{HashArena, IdSource, RoundContext, WorkerContext};
pub use error::Rejection;
pub use mempool::Mempool;
pub use object::{DeltaGuard, RevertableObject};
pub use priority::{compare_prioritized, sort_for_resolution, DeltaPriority, PrioritizedDelta};
pub use table::{ObjectTable, StateChange};
pub use types::{
    DeltaKind, HashSetEntry, HashSetValue, ObjectType, StorageDelta, StorageObject,
    HASH_SET_MAX_SIZE,
};
