//! Transaction execution strategies.
//!
//! This module provides the [`Executor`] trait and implementations for
//! different ways of driving delta transactions through rounds.

mod parallel;
mod sequential;

pub use parallel::{ParallelConfig, ParallelExecutor};
pub use sequential::SequentialExecutor;

use crate::{DeltaTransaction, StateMap, Workload};
use revertable_state::{DeltaGuard, ObjectTable, StateChange, WorkerContext};

/// Result of executing a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Number of transactions whose deltas were all committed.
    pub successful: usize,
    /// Number of transactions that never got accepted.
    pub failed: usize,
    /// Number of rounds committed.
    pub rounds: usize,
    /// Total number of transaction attempts, including retries.
    pub attempts: usize,
}

impl ExecutionResult {
    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Trait for different transaction execution strategies.
///
/// # Implementing a New Executor
///
/// ```ignore
/// use delta_bench::executor::{Executor, ExecutionResult};
/// use delta_bench::{StateMap, Workload};
///
/// pub struct BatchedExecutor {
///     pub batch_size: usize,
/// }
///
/// impl Executor for BatchedExecutor {
///     fn execute(&self, state: StateMap, workload: &Workload) -> (StateMap, ExecutionResult) {
///         // Your implementation here
///         todo!()
///     }
/// }
/// ```
pub trait Executor {
    /// Executes the workload starting from `state`.
    ///
    /// # Returns
    /// A tuple of (final state, execution result).
    fn execute(&self, state: StateMap, workload: &Workload) -> (StateMap, ExecutionResult);

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Applies every delta of `tx` against `table`, seeding new objects from
/// `state`. Either all deltas are committed and `true` is returned, or none
/// are and the transaction left no trace.
pub(crate) fn apply_transaction(
    table: &ObjectTable,
    state: &StateMap,
    ctx: &WorkerContext<'_>,
    tx: &DeltaTransaction,
) -> bool {
    let objects: Vec<_> = tx
        .deltas
        .iter()
        .map(|(key, _)| table.get_or_create(*key, || state.get(key).cloned()))
        .collect();

    let mut guards: Vec<DeltaGuard<'_>> = Vec::with_capacity(objects.len());
    for (object, (_, delta)) in objects.iter().zip(&tx.deltas) {
        match object.try_add_delta(ctx, delta) {
            Some(guard) => guards.push(guard),
            // Dropping the accepted guards reverts them.
            None => return false,
        }
    }
    guards.into_iter().for_each(DeltaGuard::commit);
    true
}

/// Writes a round's committed changes into durable state.
pub(crate) fn apply_changes(state: &mut StateMap, changes: Vec<StateChange>) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                state.insert(key, value);
            }
            None => {
                state.remove(&key);
            }
        }
    }
}
