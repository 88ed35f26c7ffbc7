//! CLI for running delta-engine benchmarks.
//!
//! # Example
//!
//! ```bash
//! # Compare both executors across the default conflict levels
//! delta-bench --keys 1000 --transactions 5000
//!
//! # One parallel run at a fixed conflict factor
//! delta-bench --executor parallel --conflict 0.5 --threads 8
//! ```

use clap::{Parser, ValueEnum};
use delta_bench::{
    ConfigError, Executor, ParallelConfig, ParallelExecutor, SequentialExecutor, Workload,
    WorkloadConfig,
};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExecutorKind {
    Sequential,
    Parallel,
    All,
}

/// Delta-engine benchmark
///
/// Generates keyed delta workloads and runs them through the sequential and
/// parallel executors.
#[derive(Parser, Debug)]
#[command(name = "delta-bench")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of keys in the state
    #[arg(short = 'k', long, default_value = "1000")]
    keys: usize,

    /// Number of transactions per run
    #[arg(short = 'n', long, default_value = "1000")]
    transactions: usize,

    /// Keys touched by each transaction
    #[arg(long, default_value = "2")]
    deltas_per_tx: usize,

    /// Conflict factor (0.0-1.0). When omitted, a sweep over 0, 0.25, 0.5, 0.75 and 1 is run.
    #[arg(short = 'c', long)]
    conflict: Option<f64>,

    /// Random seed for reproducible workloads
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Executor to run
    #[arg(short = 'e', long, value_enum, default_value = "all")]
    executor: ExecutorKind,

    /// Worker threads for the parallel executor. Defaults to available parallelism.
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Mempool capacity for the parallel executor (power of two)
    #[arg(long, default_value = "1024")]
    mempool_capacity: usize,

    /// Rounds before a rejected transaction counts as failed
    #[arg(long, default_value = "8")]
    max_rounds: usize,
}

fn main() -> Result<(), ConfigError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,delta_bench=info,revertable_state=info")),
        )
        .init();

    let args = Args::parse();

    let parallel_config = ParallelConfig {
        num_threads: args
            .threads
            .unwrap_or_else(|| ParallelConfig::default().num_threads),
        mempool_capacity: args.mempool_capacity,
        max_rounds: args.max_rounds,
    };

    let mut executors: Vec<Box<dyn Executor>> = Vec::new();
    if matches!(args.executor, ExecutorKind::Sequential | ExecutorKind::All) {
        executors.push(Box::new(SequentialExecutor::new()));
    }
    if matches!(args.executor, ExecutorKind::Parallel | ExecutorKind::All) {
        executors.push(Box::new(ParallelExecutor::new(parallel_config.clone())?));
    }

    let conflicts = match args.conflict {
        Some(factor) => vec![factor],
        None => vec![0.0, 0.25, 0.5, 0.75, 1.0],
    };

    info!(
        keys = args.keys,
        transactions = args.transactions,
        deltas_per_tx = args.deltas_per_tx,
        threads = parallel_config.num_threads,
        seed = args.seed,
        "Starting benchmark"
    );

    for executor in &executors {
        println!("\n--- {} ---", executor.name());
        for &conflict_factor in &conflicts {
            let config = WorkloadConfig {
                num_keys: args.keys,
                num_transactions: args.transactions,
                deltas_per_tx: args.deltas_per_tx,
                conflict_factor,
                seed: args.seed,
            };
            run_benchmark(executor.as_ref(), config)?;
        }
    }

    Ok(())
}

fn run_benchmark(executor: &dyn Executor, config: WorkloadConfig) -> Result<(), ConfigError> {
    let conflict_factor = config.conflict_factor;
    let workload = Workload::generate(config)?;
    let state = workload.create_state();

    let start = Instant::now();
    let (_, result) = executor.execute(state, &workload);
    let elapsed = start.elapsed();

    let tps = result.total() as f64 / elapsed.as_secs_f64();

    println!(
        "{:>5.0}% conflicts | {:5} successful | {:5} failed | {:2} rounds | {:8.2} ms | {:8.0} tx/s",
        conflict_factor * 100.0,
        result.successful,
        result.failed,
        result.rounds,
        elapsed.as_secs_f64() * 1000.0,
        tps
    );
    Ok(())
}
