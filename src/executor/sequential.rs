//! Sequential transaction executor.
//!
//! This module provides a baseline executor that applies transactions one at
//! a time on a single worker, in canonical priority order, within one round.

use revertable_state::{ObjectTable, RoundContext};
use tracing::debug;

use super::{apply_changes, apply_transaction, ExecutionResult, Executor};
use crate::{sort_by_priority, StateMap, Workload};

/// Sequential executor that processes transactions one at a time.
///
/// A transaction whose deltas cannot all be applied fails immediately; it is
/// never retried, since a single worker sees the same conflicts every time.
///
/// # Example
///
/// ```
/// use delta_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default()).unwrap();
/// let state = workload.create_state();
///
/// let executor = SequentialExecutor::new();
/// let (final_state, result) = executor.execute(state, &workload);
///
/// println!("Successful: {}, Failed: {}", result.successful, result.failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SequentialExecutor {
    fn execute(&self, mut state: StateMap, workload: &Workload) -> (StateMap, ExecutionResult) {
        let mut ordered: Vec<_> = workload.transactions.iter().collect();
        sort_by_priority(&mut ordered);

        let round = RoundContext::new(1);
        let mut table = ObjectTable::new();
        let mut successful = 0;
        let mut failed = 0;

        {
            let ctx = round.worker(0);
            for tx in &ordered {
                if apply_transaction(&table, &state, &ctx, tx) {
                    successful += 1;
                } else {
                    failed += 1;
                }
            }
        }

        let changes = table.commit_round(round.arena());
        debug!(successful, failed, changed = changes.len(), "sequential round done");
        apply_changes(&mut state, changes);

        (
            state,
            ExecutionResult {
                successful,
                failed,
                rounds: 1,
                attempts: ordered.len(),
            },
        )
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key_at, DeltaTransaction, WorkloadConfig};
    use alloy_primitives::B256;
    use revertable_state::{DeltaPriority, StorageDelta, StorageObject};

    #[test]
    fn test_sequential_executor() {
        let config = WorkloadConfig {
            num_keys: 100,
            num_transactions: 50,
            deltas_per_tx: 2,
            conflict_factor: 0.0,
            seed: 42,
        };

        let workload = Workload::generate(config).unwrap();
        let state = workload.create_state();

        let (_, result) = SequentialExecutor::new().execute(state, &workload);

        assert_eq!(result.total(), 50);
        assert_eq!(result.rounds, 1);
        assert!(result.successful > 0);
    }

    #[test]
    fn test_higher_priority_write_wins() {
        let key = key_at(1);
        let tx = |custom, byte: u8| {
            let tx_hash = B256::repeat_byte(byte);
            DeltaTransaction {
                tx_hash,
                priority: DeltaPriority::new(custom, tx_hash),
                deltas: vec![(key, StorageDelta::RawMemoryWrite(vec![byte]))],
            }
        };
        let workload = Workload {
            transactions: vec![tx(1, 0xaa), tx(5, 0xbb), tx(3, 0xcc)],
            config: WorkloadConfig {
                num_keys: 4,
                num_transactions: 3,
                deltas_per_tx: 1,
                ..WorkloadConfig::default()
            },
        };

        let (state, result) = SequentialExecutor::new().execute(workload.create_state(), &workload);

        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 2);
        assert_eq!(state[&key], StorageObject::RawMemory(vec![0xbb]));
    }
}
