//! Version store benchmarks for txcore.
//!
//! Benchmarks for:
//! - Committed writes into fresh chains
//! - Snapshot reads over long version chains
//! - Vacuum sweeps

use std::collections::HashSet;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use txcore_common::types::{IsolationLevel, RowKey, TableId, Timestamp, TxnId};
use txcore_mvcc::{Snapshot, VersionStore};

fn key(row: u64) -> RowKey {
    RowKey::new(TableId::new(1), row)
}

/// Builds a store where every row has `depth` committed versions.
fn populated_store(rows: u64, depth: u64) -> VersionStore {
    let store = VersionStore::new();
    let mut ts = 0;
    for round in 0..depth {
        for row in 0..rows {
            ts += 1;
            let txn = TxnId::new(ts);
            let w = store
                .write(key(row), txn, Bytes::from(format!("r{row}v{round}")))
                .unwrap();
            store.commit(&[w], Timestamp::new(ts));
        }
    }
    store
}

/// Benchmark committed single-row writes.
fn bench_write_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("mvcc/write_commit");

    for size in [1000u64, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let store = VersionStore::new();
                for row in 0..size {
                    let w = store
                        .write(key(row), TxnId::new(row + 1), Bytes::from_static(b"payload"))
                        .unwrap();
                    store.commit(&[w], Timestamp::new(row + 1));
                }
                black_box(store.key_count())
            });
        });
    }

    group.finish();
}

/// Benchmark reads at an old snapshot that must walk the chain.
fn bench_snapshot_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("mvcc/snapshot_read");

    for depth in [1u64, 8, 32].iter() {
        let rows = 1000;
        let store = populated_store(rows, *depth);
        let oldest = Snapshot::new(
            TxnId::new(u64::MAX - 1),
            Timestamp::new(rows),
            HashSet::new(),
            IsolationLevel::RepeatableRead,
        );
        let mut rng = StdRng::seed_from_u64(42);

        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, _| {
            b.iter(|| {
                let row = rng.gen_range(0..rows);
                black_box(store.read(&key(row), &oldest))
            });
        });
    }

    group.finish();
}

/// Benchmark a full sweep that reclaims all but the newest version.
fn bench_sweep(c: &mut Criterion) {
    c.bench_function("mvcc/sweep_1000x8", |b| {
        b.iter_with_setup(
            || populated_store(1000, 8),
            |store| black_box(store.sweep(Timestamp::MAX, usize::MAX)),
        );
    });
}

criterion_group!(benches, bench_write_commit, bench_snapshot_read, bench_sweep);
criterion_main!(benches);
