//! Multi-threaded round-based executor.
//!
//! Each round feeds the pending transactions through a [`Mempool`] to a pool
//! of workers. Workers apply deltas speculatively against a shared
//! [`ObjectTable`]; a transaction whose deltas are all accepted commits, any
//! other is reverted and queued for the next round in priority order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use revertable_state::{Mempool, ObjectTable, RoundContext};
use tracing::{debug, info};

use super::{apply_changes, apply_transaction, ExecutionResult, Executor};
use crate::{sort_by_priority, ConfigError, DeltaTransaction, StateMap, Workload};

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Number of worker threads.
    pub num_threads: usize,
    /// Mempool capacity; must be a power of two.
    pub mempool_capacity: usize,
    /// Rounds a transaction may be attempted in before it counts as failed.
    pub max_rounds: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map_or(4, |n| n.get()),
            mempool_capacity: 1024,
            max_rounds: 8,
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if !self.mempool_capacity.is_power_of_two() || self.mempool_capacity > 1 << 31 {
            return Err(ConfigError::MempoolCapacity(self.mempool_capacity));
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::NoRounds);
        }
        Ok(())
    }
}

/// Outcome of a single round.
struct RoundOutcome<'w> {
    accepted: usize,
    rejected: Vec<&'w DeltaTransaction>,
}

/// Parallel round-based executor.
#[derive(Debug)]
pub struct ParallelExecutor {
    config: ParallelConfig,
}

impl ParallelExecutor {
    /// Creates a new parallel executor.
    pub fn new(config: ParallelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Runs one round: the calling thread produces, workers consume.
    fn run_round<'w>(
        &self,
        table: &ObjectTable,
        state: &StateMap,
        round: &RoundContext,
        mut pending: Vec<&'w DeltaTransaction>,
    ) -> RoundOutcome<'w> {
        let mempool = Mempool::new(self.config.mempool_capacity);
        let producer_done = AtomicBool::new(false);
        let accepted = AtomicUsize::new(0);
        let rejected = Mutex::new(Vec::new());

        thread::scope(|s| {
            for worker_id in 0..round.num_workers() {
                let (mempool, producer_done, accepted, rejected) =
                    (&mempool, &producer_done, &accepted, &rejected);
                s.spawn(move || {
                    let ctx = round.worker(worker_id);
                    let mut local_rejected = Vec::new();
                    loop {
                        // Read the flag before polling so an empty poll after
                        // it was set really means the mempool is drained.
                        let done = producer_done.load(Ordering::Acquire);
                        match mempool.get_new_tx() {
                            Some(tx) => {
                                if apply_transaction(table, state, &ctx, tx) {
                                    accepted.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    local_rejected.push(tx);
                                }
                            }
                            None if done => break,
                            None => thread::yield_now(),
                        }
                    }
                    rejected.lock().extend(local_rejected);
                });
            }

            while !pending.is_empty() {
                if mempool.add_txs(&mut pending) == 0 {
                    thread::yield_now();
                }
            }
            producer_done.store(true, Ordering::Release);
        });

        RoundOutcome {
            accepted: accepted.into_inner(),
            rejected: rejected.into_inner(),
        }
    }
}

impl Executor for ParallelExecutor {
    fn execute(&self, mut state: StateMap, workload: &Workload) -> (StateMap, ExecutionResult) {
        let mut round = RoundContext::new(self.config.num_threads);
        let mut table = ObjectTable::new();
        let mut result = ExecutionResult::default();

        let mut pending: Vec<_> = workload.transactions.iter().collect();
        sort_by_priority(&mut pending);

        while !pending.is_empty() && result.rounds < self.config.max_rounds {
            let start = Instant::now();
            result.attempts += pending.len();

            let outcome = self.run_round(&table, &state, &round, pending);
            let changes = table.commit_round(round.arena());
            debug!(
                round = result.rounds,
                hashes = round.arena().allocated(),
                changed = changes.len(),
                "round committed"
            );
            apply_changes(&mut state, changes);
            round.reset();

            result.rounds += 1;
            result.successful += outcome.accepted;
            info!(
                round = result.rounds,
                accepted = outcome.accepted,
                rejected = outcome.rejected.len(),
                elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                "round finished"
            );

            pending = outcome.rejected;
            sort_by_priority(&mut pending);
        }

        result.failed = pending.len();
        (state, result)
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key_at, WorkloadConfig};
    use alloy_primitives::B256;
    use revertable_state::{DeltaPriority, StorageDelta, StorageObject};

    fn executor(num_threads: usize, max_rounds: usize) -> ParallelExecutor {
        ParallelExecutor::new(ParallelConfig {
            num_threads,
            mempool_capacity: 32,
            max_rounds,
        })
        .unwrap()
    }

    #[test]
    fn test_parallel_executor_accounts_for_every_tx() {
        let workload = Workload::generate(WorkloadConfig {
            num_keys: 200,
            num_transactions: 500,
            deltas_per_tx: 3,
            conflict_factor: 0.5,
            seed: 11,
        })
        .unwrap();

        let (_, result) = executor(4, 4).execute(workload.create_state(), &workload);

        assert_eq!(result.total(), 500);
        assert!(result.rounds >= 1 && result.rounds <= 4);
        assert!(result.attempts >= 500);
        assert!(result.successful > 0);
    }

    #[test]
    fn test_conflicting_writes_retry_in_later_rounds() {
        let key = key_at(1);
        let transactions = (1..=4u8)
            .map(|byte| {
                let tx_hash = B256::repeat_byte(byte);
                DeltaTransaction {
                    tx_hash,
                    priority: DeltaPriority::new(0, tx_hash),
                    deltas: vec![(key, StorageDelta::RawMemoryWrite(vec![byte]))],
                }
            })
            .collect();
        let workload = Workload {
            transactions,
            config: WorkloadConfig {
                num_keys: 4,
                num_transactions: 4,
                deltas_per_tx: 1,
                ..WorkloadConfig::default()
            },
        };

        // One distinct write per key can land per round.
        let (state, result) = executor(2, 8).execute(workload.create_state(), &workload);
        assert_eq!(result.successful, 4);
        assert_eq!(result.failed, 0);
        assert_eq!(result.rounds, 4);
        assert!(matches!(state[&key], StorageObject::RawMemory(_)));

        let (_, limited) = executor(2, 2).execute(workload.create_state(), &workload);
        assert_eq!(limited.successful, 2);
        assert_eq!(limited.failed, 2);
    }

    #[test]
    fn test_invalid_config() {
        let config = |num_threads, mempool_capacity, max_rounds| ParallelConfig {
            num_threads,
            mempool_capacity,
            max_rounds,
        };
        assert_eq!(
            ParallelExecutor::new(config(0, 8, 1)).unwrap_err(),
            ConfigError::NoThreads
        );
        assert_eq!(
            ParallelExecutor::new(config(1, 12, 1)).unwrap_err(),
            ConfigError::MempoolCapacity(12)
        );
        assert_eq!(
            ParallelExecutor::new(config(1, 8, 0)).unwrap_err(),
            ConfigError::NoRounds
        );
    }
}
