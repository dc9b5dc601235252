//! Lock manager benchmarks for txcore.
//!
//! Benchmarks for:
//! - Uncontended row lock acquire and release_all
//! - Shared grants on a hot row
//! - Wait-for edge collection with many blocked waiters

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use txcore_common::types::{RowKey, TableId, TxnId};
use txcore_txn::{LockManager, LockMode, ResourceId};

fn row(r: u64) -> ResourceId {
    ResourceId::row(RowKey::new(TableId::new(1), r))
}

/// Benchmark a transaction locking `size` random rows and releasing them.
fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock/acquire_release");

    for size in [10u64, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let locks = LockManager::new();
            let mut rng = StdRng::seed_from_u64(42);
            let mut next = 1u64;
            b.iter(|| {
                let txn = TxnId::new(next);
                next += 1;
                locks.register(txn);
                locks
                    .acquire(txn, ResourceId::table(TableId::new(1)), LockMode::IntentionExclusive, None)
                    .unwrap();
                for _ in 0..size {
                    let r = rng.gen_range(0..1_000_000);
                    black_box(locks.acquire(txn, row(r), LockMode::Exclusive, None).unwrap());
                }
                locks.release_all(txn)
            });
        });
    }

    group.finish();
}

/// Benchmark many readers sharing one row.
fn bench_shared_hot_row(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock/shared_hot_row");

    for readers in [8u64, 64].iter() {
        group.throughput(Throughput::Elements(*readers));
        group.bench_with_input(BenchmarkId::from_parameter(readers), readers, |b, &readers| {
            let locks = LockManager::new();
            b.iter(|| {
                for r in 1..=readers {
                    let txn = TxnId::new(r);
                    locks.register(txn);
                    locks.acquire(txn, row(0), LockMode::Shared, None).unwrap();
                }
                for r in 1..=readers {
                    locks.release_all(TxnId::new(r));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark building wait-for edges while threads queue behind a holder.
fn bench_wait_for_edges(c: &mut Criterion) {
    let locks = Arc::new(LockManager::new());
    let holder = TxnId::new(1);
    locks.register(holder);
    locks.acquire(holder, row(0), LockMode::Exclusive, None).unwrap();

    let waiters: Vec<_> = (2..34u64)
        .map(|t| {
            let locks = Arc::clone(&locks);
            let txn = TxnId::new(t);
            locks.register(txn);
            thread::spawn(move || {
                let _ = locks.acquire(txn, row(0), LockMode::Shared, Some(Duration::from_secs(60)));
            })
        })
        .collect();
    while locks.waiting_count() < waiters.len() {
        thread::sleep(Duration::from_millis(1));
    }

    c.bench_function("lock/wait_for_edges", |b| {
        b.iter(|| black_box(locks.wait_for_edges()))
    });

    locks.release_all(holder);
    for handle in waiters {
        handle.join().unwrap();
    }
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_shared_hot_row,
    bench_wait_for_edges
);
criterion_main!(benches);
