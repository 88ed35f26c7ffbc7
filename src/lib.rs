//! Benchmarking harness for the speculative state-update engine.
//!
//! This crate drives [`revertable_state`] end to end: it generates keyed
//! delta workloads with a tunable conflict rate and runs them through
//! different execution strategies.
//!
//! # Architecture
//!
//! The framework is organized around three main concepts:
//!
//! - **Workload**: A pre-generated set of keys and delta transactions
//! - **Executor**: A strategy for applying transactions (sequential, parallel)
//! - **State**: The durable key → value map rounds commit into
//!
//! # Quick Start
//!
//! ```
//! use delta_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_keys: 64,
//!     num_transactions: 50,
//!     deltas_per_tx: 2,
//!     conflict_factor: 0.0,
//!     seed: 42,
//! };
//!
//! let workload = Workload::generate(config).expect("valid config");
//! let state = workload.create_state();
//!
//! let executor = SequentialExecutor::new();
//! let (final_state, result) = executor.execute(state, &workload);
//!
//! println!("Successful: {}", result.successful);
//! ```

pub mod executor;

pub use executor::{
    ExecutionResult, Executor, ParallelConfig, ParallelExecutor, SequentialExecutor,
};

use alloy_primitives::{keccak256, B256};
use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use revertable_state::{DeltaPriority, HashSetEntry, HashSetValue, StorageDelta, StorageObject};
use std::collections::HashMap;
use thiserror::Error;

/// Durable state: the committed value of every live key.
pub type StateMap = HashMap<B256, StorageObject>;

// ============================================================================
// Errors
// ============================================================================

/// Invalid workload or executor configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("conflict factor must be within [0, 1], got {0}")]
    ConflictFactor(f64),
    #[error("workload needs at least one key")]
    NoKeys,
    #[error("deltas per transaction must be between 1 and the key count ({num_keys}), got {deltas_per_tx}")]
    DeltasPerTx { deltas_per_tx: usize, num_keys: usize },
    #[error("parallel executor needs at least one thread")]
    NoThreads,
    #[error("mempool capacity must be a nonzero power of two, got {0}")]
    MempoolCapacity(usize),
    #[error("parallel executor needs at least one round")]
    NoRounds,
}

// ============================================================================
// Keys
// ============================================================================

/// Initial value of every counter key. Counter deltas set this value and add
/// to it.
pub const COUNTER_BASE: u64 = 1_000_000;

/// Initial supply of every asset key.
pub const ASSET_SUPPLY: u64 = 10_000;

/// Initial soft limit of every hash-set key.
pub const HASH_SET_LIMIT: u64 = 16;

/// Value type of a key, fixed by its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Counter,
    Blob,
    HashSet,
    Asset,
}

impl KeyClass {
    pub fn of(index: usize) -> Self {
        match index % 4 {
            0 => KeyClass::Counter,
            1 => KeyClass::Blob,
            2 => KeyClass::HashSet,
            _ => KeyClass::Asset,
        }
    }

    /// Value a key of this class starts with.
    pub fn initial_value(self) -> StorageObject {
        match self {
            KeyClass::Counter => StorageObject::NonnegativeInt64(COUNTER_BASE),
            KeyClass::Blob => StorageObject::RawMemory(vec![0; 8]),
            KeyClass::HashSet => StorageObject::HashSet(HashSetValue::with_max_size(HASH_SET_LIMIT)),
            KeyClass::Asset => StorageObject::KnownSupplyAsset(ASSET_SUPPLY),
        }
    }
}

/// Storage key of the key with the given index.
pub fn key_at(index: usize) -> B256 {
    keccak256((index as u64).to_be_bytes())
}

// ============================================================================
// Delta Transaction
// ============================================================================

/// A transaction reduced to the deltas it applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaTransaction {
    /// Unique transaction hash.
    pub tx_hash: B256,
    /// Priority shared by all of this transaction's deltas.
    pub priority: DeltaPriority,
    /// Target key and delta, at most one per key.
    pub deltas: Vec<(B256, StorageDelta)>,
}

impl DeltaTransaction {
    fn compute_tx_hash(seed: u64, nonce: u64) -> B256 {
        let mut data = Vec::with_capacity(8 + 8);
        data.extend_from_slice(&seed.to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        keccak256(&data)
    }
}

/// Orders transactions so the highest [`DeltaPriority`] comes first.
pub fn sort_by_priority(transactions: &mut [&DeltaTransaction]) {
    transactions.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Total number of keys in the state.
    pub num_keys: usize,
    /// Number of transactions to generate.
    pub num_transactions: usize,
    /// Number of distinct keys each transaction touches.
    pub deltas_per_tx: usize,
    /// Conflict factor: 0.0 = keys drawn uniformly, 1.0 = all transactions
    /// share a tiny hot set.
    pub conflict_factor: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_keys: 1000,
            num_transactions: 1000,
            deltas_per_tx: 2,
            conflict_factor: 0.0,
            seed: 42,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.conflict_factor) {
            return Err(ConfigError::ConflictFactor(self.conflict_factor));
        }
        if self.num_keys == 0 {
            return Err(ConfigError::NoKeys);
        }
        if self.deltas_per_tx == 0 || self.deltas_per_tx > self.num_keys {
            return Err(ConfigError::DeltasPerTx {
                deltas_per_tx: self.deltas_per_tx,
                num_keys: self.num_keys,
            });
        }
        Ok(())
    }

    /// Size of the key range "hot" transactions draw from.
    fn hot_key_count(&self) -> usize {
        if self.conflict_factor > 0.0 {
            let floor = self.deltas_per_tx.max(2) as f64;
            (floor + (1.0 - self.conflict_factor) * (self.num_keys as f64 - floor))
                .max(floor) as usize
        } else {
            self.num_keys
        }
    }
}

/// A complete benchmark workload.
#[derive(Debug, Clone)]
pub struct Workload {
    /// The transactions to execute, in generation order.
    pub transactions: Vec<DeltaTransaction>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    pub fn generate(config: WorkloadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hot_key_count = config.hot_key_count();

        let transactions = (0..config.num_transactions)
            .map(|nonce| {
                let use_hot = rng.gen::<f64>() < config.conflict_factor;
                let range = if use_hot { hot_key_count } else { config.num_keys };
                let tx_hash = DeltaTransaction::compute_tx_hash(config.seed, nonce as u64);
                let priority = DeltaPriority::new(rng.gen_range(0..4), tx_hash);

                let deltas = index::sample(&mut rng, range, config.deltas_per_tx)
                    .into_iter()
                    .map(|key_index| {
                        let delta = Self::random_delta(&mut rng, KeyClass::of(key_index), tx_hash, nonce);
                        (key_at(key_index), delta)
                    })
                    .collect();

                DeltaTransaction {
                    tx_hash,
                    priority,
                    deltas,
                }
            })
            .collect();

        Ok(Self {
            transactions,
            config,
        })
    }

    fn random_delta(rng: &mut StdRng, class: KeyClass, tx_hash: B256, nonce: usize) -> StorageDelta {
        match class {
            KeyClass::Counter => StorageDelta::NonnegativeInt64SetAdd {
                set_value: COUNTER_BASE,
                delta: rng.gen_range(-5..=10),
            },
            KeyClass::Blob => {
                if rng.gen_ratio(1, 64) {
                    StorageDelta::DeleteLast
                } else {
                    // A small alphabet lets some concurrent writers join.
                    StorageDelta::RawMemoryWrite(vec![rng.gen_range(1..=4u8); 8])
                }
            }
            KeyClass::HashSet => match rng.gen_range(0..16) {
                0 => StorageDelta::HashSetIncreaseLimit { amount: 4 },
                1 => StorageDelta::HashSetClear {
                    threshold: (nonce as u64).saturating_sub(64),
                },
                _ => StorageDelta::HashSetInsert {
                    entry: HashSetEntry::new(keccak256(tx_hash), nonce as u64),
                },
            },
            KeyClass::Asset => StorageDelta::AssetAdd {
                delta: rng.gen_range(-50..=100),
            },
        }
    }

    /// Creates the initial state: every key holds its class's initial value.
    pub fn create_state(&self) -> StateMap {
        (0..self.config.num_keys)
            .map(|index| (key_at(index), KeyClass::of(index).initial_value()))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_workload_generation() {
        let config = WorkloadConfig {
            num_keys: 10,
            num_transactions: 20,
            deltas_per_tx: 3,
            conflict_factor: 0.0,
            seed: 123,
        };

        let workload = Workload::generate(config).unwrap();
        assert_eq!(workload.transactions.len(), 20);

        for tx in &workload.transactions {
            assert_eq!(tx.deltas.len(), 3);
            let keys: HashSet<_> = tx.deltas.iter().map(|(key, _)| *key).collect();
            assert_eq!(keys.len(), 3, "keys within a transaction are distinct");
            assert_eq!(tx.priority.tx_hash, tx.tx_hash);
        }

        let hashes: HashSet<_> = workload.transactions.iter().map(|tx| tx.tx_hash).collect();
        assert_eq!(hashes.len(), 20);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = Workload::generate(WorkloadConfig::default()).unwrap();
        let b = Workload::generate(WorkloadConfig::default()).unwrap();
        assert_eq!(a.transactions, b.transactions);
    }

    #[test]
    fn test_full_conflict_uses_hot_range() {
        let config = WorkloadConfig {
            num_keys: 1000,
            num_transactions: 200,
            deltas_per_tx: 2,
            conflict_factor: 1.0,
            seed: 7,
        };
        let hot: HashSet<_> = (0..2).map(key_at).collect();

        let workload = Workload::generate(config).unwrap();
        assert!(workload
            .transactions
            .iter()
            .flat_map(|tx| tx.deltas.iter())
            .all(|(key, _)| hot.contains(key)));
    }

    #[test]
    fn test_deltas_match_key_class() {
        let workload = Workload::generate(WorkloadConfig::default()).unwrap();
        let classes: HashMap<_, _> = (0..workload.config.num_keys)
            .map(|index| (key_at(index), KeyClass::of(index)))
            .collect();

        for (key, delta) in workload.transactions.iter().flat_map(|tx| tx.deltas.iter()) {
            let class = classes[key];
            let matches = match delta {
                StorageDelta::NonnegativeInt64SetAdd { .. } => class == KeyClass::Counter,
                StorageDelta::RawMemoryWrite(_) | StorageDelta::DeleteLast => {
                    class == KeyClass::Blob
                }
                StorageDelta::HashSetInsert { .. }
                | StorageDelta::HashSetIncreaseLimit { .. }
                | StorageDelta::HashSetClear { .. } => class == KeyClass::HashSet,
                StorageDelta::AssetAdd { .. } => class == KeyClass::Asset,
                StorageDelta::DeleteFirst => false,
            };
            assert!(matches, "{delta:?} generated for a {class:?} key");
        }
    }

    #[test]
    fn test_create_state() {
        let workload = Workload::generate(WorkloadConfig {
            num_keys: 8,
            num_transactions: 0,
            ..WorkloadConfig::default()
        })
        .unwrap();

        let state = workload.create_state();
        assert_eq!(state.len(), 8);
        assert_eq!(
            state[&key_at(3)],
            StorageObject::KnownSupplyAsset(ASSET_SUPPLY)
        );
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let bad_factor = WorkloadConfig {
            conflict_factor: 1.5,
            ..WorkloadConfig::default()
        };
        assert_eq!(bad_factor.validate(), Err(ConfigError::ConflictFactor(1.5)));

        let no_keys = WorkloadConfig {
            num_keys: 0,
            ..WorkloadConfig::default()
        };
        assert_eq!(no_keys.validate(), Err(ConfigError::NoKeys));

        let too_many = WorkloadConfig {
            num_keys: 2,
            deltas_per_tx: 3,
            ..WorkloadConfig::default()
        };
        assert!(matches!(
            too_many.validate(),
            Err(ConfigError::DeltasPerTx { .. })
        ));
    }

    #[test]
    fn test_sort_by_priority() {
        let workload = Workload::generate(WorkloadConfig {
            num_transactions: 50,
            ..WorkloadConfig::default()
        })
        .unwrap();
        let mut ordered: Vec<_> = workload.transactions.iter().collect();
        sort_by_priority(&mut ordered);

        assert!(ordered
            .windows(2)
            .all(|pair| pair[0].priority > pair[1].priority));
    }
}
