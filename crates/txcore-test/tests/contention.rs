//! Randomised lock contention through the transaction manager.
//!
//! Worker threads run short transactions over a handful of hot rows with
//! the background detector enabled. Every transaction must end: committed,
//! timed out, or rolled back as a deadlock victim. Nobody may hang.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use txcore_common::types::IsolationLevel;
use txcore_test::{users, TestCore};
use txcore_txn::{LockMode, ResourceId, TxnError};

const WORKERS: u64 = 8;
const ROUNDS: usize = 40;
const HOT_ROWS: u64 = 4;

#[derive(Default)]
struct Outcomes {
    committed: AtomicUsize,
    timed_out: AtomicUsize,
    victims: AtomicUsize,
}

#[test]
fn test_every_transaction_ends() {
    let core = TestCore::with_config(|config| {
        config.deadlock.enabled = true;
        config.deadlock.interval = Duration::from_millis(20);
        config.lock.timeout = Duration::from_secs(2);
    });
    let tm = Arc::clone(core.tm());
    let outcomes = Arc::new(Outcomes::default());

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let tm = Arc::clone(&tm);
            let outcomes = Arc::clone(&outcomes);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0x5EED + worker);
                for round in 0..ROUNDS {
                    let txn = tm.begin(IsolationLevel::ReadCommitted).unwrap();
                    let writes = rng.gen_range(1..=3usize);
                    let rows: Vec<u64> =
                        (0..writes).map(|_| rng.gen_range(0..HOT_ROWS)).collect();
                    let result = rows
                        .iter()
                        .try_for_each(|row| {
                            let value = Bytes::from(format!("w{worker} r{round}"));
                            tm.write(txn, users(*row), value)
                        })
                        .and_then(|()| tm.commit(txn));
                    match result {
                        Ok(_) => {
                            outcomes.committed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TxnError::LockTimeout { .. }) => {
                            tm.abort(txn).unwrap();
                            outcomes.timed_out.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TxnError::DeadlockVictim(_)) => {
                            outcomes.victims.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let ended = outcomes.committed.load(Ordering::Relaxed)
        + outcomes.timed_out.load(Ordering::Relaxed)
        + outcomes.victims.load(Ordering::Relaxed);
    assert_eq!(ended, (WORKERS as usize) * ROUNDS);
    assert!(outcomes.committed.load(Ordering::Relaxed) > 0);
    assert_eq!(
        outcomes.victims.load(Ordering::Relaxed) as u64,
        tm.stats().snapshot().deadlock_victims
    );

    assert_eq!(tm.active_count(), 0);
    assert_eq!(tm.lock_manager().lock_count(), 0);
    assert_eq!(tm.lock_manager().waiting_count(), 0);
}

#[test]
fn test_exclusive_section_is_never_shared() {
    let core = TestCore::new();
    let tm = Arc::clone(core.tm());
    let resource = ResourceId::row(users(0));

    // >0: that many shared holders inside; -1: one exclusive holder inside.
    let inside = Arc::new(AtomicI64::new(0));

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let tm = Arc::clone(&tm);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for _ in 0..ROUNDS {
                    let txn = tm.begin_default().unwrap();
                    let exclusive = rng.gen_bool(0.3);
                    let mode = if exclusive {
                        LockMode::Exclusive
                    } else {
                        LockMode::Shared
                    };
                    tm.lock(txn, resource, mode, None).unwrap();

                    if exclusive {
                        let prev = inside.swap(-1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "exclusive entered while {prev} inside");
                        thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                        assert_eq!(inside.swap(0, Ordering::SeqCst), -1);
                    } else {
                        let prev = inside.fetch_add(1, Ordering::SeqCst);
                        assert!(prev >= 0, "shared entered under exclusive");
                        thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }

                    tm.commit(txn).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(inside.load(Ordering::SeqCst), 0);
    assert_eq!(tm.lock_manager().lock_count(), 0);
}
