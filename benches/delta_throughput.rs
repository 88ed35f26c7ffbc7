//! Benchmarks for delta execution and the core concurrent structures.

use alloy_primitives::B256;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use delta_bench::{
    Executor, ParallelConfig, ParallelExecutor, SequentialExecutor, Workload, WorkloadConfig,
};
use revertable_state::{AtomicSet, HashSetEntry, Mempool, RoundContext};

/// Benchmarks both executors with different conflict factors.
fn bench_conflict_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_throughput/conflict_levels");

    let conflict_factors = [0.0, 0.25, 0.5, 0.75, 1.0];
    let num_transactions = 2000;
    let sequential = SequentialExecutor::new();
    let parallel = ParallelExecutor::new(ParallelConfig::default()).expect("default config is valid");

    for &conflict_factor in &conflict_factors {
        let config = WorkloadConfig {
            num_keys: 1000,
            num_transactions,
            deltas_per_tx: 2,
            conflict_factor,
            seed: 42,
        };

        // Pre-generate the workload outside the benchmark loop.
        let workload = Workload::generate(config).expect("valid config");
        let label = format!("conflict_{:.0}%", conflict_factor * 100.0);

        group.throughput(Throughput::Elements(num_transactions as u64));
        for executor in [&sequential as &dyn Executor, &parallel as &dyn Executor] {
            group.bench_with_input(
                BenchmarkId::new(executor.name(), &label),
                &workload,
                |b, workload| {
                    b.iter(|| {
                        let state = workload.create_state();
                        let (_, result) = executor.execute(state, black_box(workload));
                        result.successful
                    });
                },
            );
        }
    }

    group.finish();
}

/// Benchmarks the parallel executor with different thread counts.
fn bench_thread_counts(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_throughput/thread_counts");

    let num_transactions = 5000;
    let workload = Workload::generate(WorkloadConfig {
        num_keys: 10_000,
        num_transactions,
        deltas_per_tx: 3,
        conflict_factor: 0.1,
        seed: 42,
    })
    .expect("valid config");

    for &num_threads in &[1, 2, 4, 8] {
        let executor = ParallelExecutor::new(ParallelConfig {
            num_threads,
            ..ParallelConfig::default()
        })
        .expect("valid config");

        group.throughput(Throughput::Elements(num_transactions as u64));
        group.bench_with_input(
            BenchmarkId::new("parallel", num_threads),
            &workload,
            |b, workload| {
                b.iter(|| {
                    let state = workload.create_state();
                    let (_, result) = executor.execute(state, black_box(workload));
                    result.successful
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks AtomicSet inserts followed by a snapshot.
fn bench_atomic_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_throughput/atomic_set");

    for &capacity in &[16usize, 64, 1024] {
        let entries: Vec<_> = (0..capacity as u64)
            .map(|n| HashSetEntry::new(B256::left_padding_from(&n.to_be_bytes()), n))
            .collect();

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::new("fill", capacity), &entries, |b, entries| {
            let mut round = RoundContext::new(1);
            let mut set = AtomicSet::new(capacity);
            b.iter(|| {
                {
                    let ctx = round.worker(0);
                    for entry in entries {
                        black_box(set.try_insert(&ctx, *entry));
                    }
                }
                let live = set.get_hashes(round.arena()).len();
                set.clear();
                round.reset();
                live
            });
        });
    }

    group.finish();
}

/// Benchmarks a single-threaded mempool fill/drain cycle.
fn bench_mempool(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_throughput/mempool");

    let capacity = 4096;
    let mempool = Mempool::new(capacity);

    group.throughput(Throughput::Elements(capacity as u64));
    group.bench_function("fill_drain", |b| {
        b.iter(|| {
            let mut batch: Vec<u64> = (0..capacity as u64).collect();
            mempool.add_txs(&mut batch);
            let mut drained = 0;
            while let Some(tx) = mempool.get_new_tx() {
                drained += black_box(tx);
            }
            drained
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_conflict_levels,
    bench_thread_counts,
    bench_atomic_set,
    bench_mempool
);
criterion_main!(benches);
