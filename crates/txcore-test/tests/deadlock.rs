//! Deadlock resolution with the background detector running.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use txcore_common::types::TxnId;
use txcore_test::{users, TestCore};
use txcore_txn::{LockMode, ResourceId, TransactionState, TxnError};

fn detecting_core() -> TestCore {
    TestCore::with_config(|config| {
        config.deadlock.enabled = true;
        config.deadlock.interval = Duration::from_millis(100);
        config.deadlock.detect_on_block = false;
    })
}

#[test]
fn test_two_transaction_cycle_resolved_within_interval() {
    let core = detecting_core();
    let tm = Arc::clone(core.tm());

    let t1 = tm.begin_default().unwrap();
    let t2 = tm.begin_default().unwrap();
    tm.write(t1, users(1), Bytes::from("t1")).unwrap();
    tm.write(t2, users(2), Bytes::from("t2")).unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let spawn_cross_write = |txn: TxnId, row: u64| {
        let tm = Arc::clone(&tm);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let result = tm.write(txn, users(row), Bytes::from("cross"));
            if result.is_ok() {
                tm.commit(txn)?;
            }
            result
        })
    };
    let h1 = spawn_cross_write(t1, 2);
    let h2 = spawn_cross_write(t2, 1);

    barrier.wait();
    let start = Instant::now();
    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();

    // One detection interval plus scheduling slack.
    let resolved_after = start.elapsed();
    assert!(
        resolved_after < Duration::from_millis(100) + Duration::from_millis(900),
        "took {resolved_after:?}"
    );

    // Exactly one victim; the younger transaction loses.
    assert!(r1.is_ok(), "{r1:?}");
    assert!(matches!(r2, Err(TxnError::DeadlockVictim(_))), "{r2:?}");
    assert_eq!(tm.state(t1), Some(TransactionState::Committed));
    assert_eq!(tm.state(t2), Some(TransactionState::Aborted));

    let history = tm.deadlock_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].victim, t2);
    let mut participants = history[0].participants.clone();
    participants.sort();
    assert_eq!(participants, vec![t1, t2]);

    // Every later call on the victim reports the deadlock.
    assert!(matches!(
        tm.read(t2, users(1)),
        Err(TxnError::DeadlockVictim(_))
    ));
    assert!(tm.lock_wait_graph().edges.is_empty());
}

#[test]
fn test_eager_detection_after_block() {
    let core = TestCore::with_config(|config| {
        config.deadlock.enabled = true;
        config.deadlock.interval = Duration::from_secs(30);
        config.deadlock.detect_on_block = true;
        config.deadlock.eager_delay = Duration::from_millis(10);
    });
    let tm = Arc::clone(core.tm());

    let t1 = tm.begin_default().unwrap();
    let t2 = tm.begin_default().unwrap();
    tm.write(t1, users(1), Bytes::from("t1")).unwrap();
    tm.write(t2, users(2), Bytes::from("t2")).unwrap();

    let h1 = {
        let tm = Arc::clone(&tm);
        thread::spawn(move || tm.write(t1, users(2), Bytes::from("t1")))
    };
    core.wait_until_blocked(t1);
    let start = Instant::now();
    let r2 = tm.write(t2, users(1), Bytes::from("t2"));

    // Far sooner than the periodic pass.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(matches!(r2, Err(TxnError::DeadlockVictim(_))));
    h1.join().unwrap().unwrap();
    tm.commit(t1).unwrap();
}

#[test]
fn test_three_transaction_ring() {
    let core = detecting_core();
    let tm = Arc::clone(core.tm());

    let txns: Vec<_> = (0..3).map(|_| tm.begin_default().unwrap()).collect();
    for (i, txn) in txns.iter().enumerate() {
        tm.write(*txn, users(i as u64), Bytes::from("own")).unwrap();
    }

    let handles: Vec<_> = txns
        .iter()
        .enumerate()
        .map(|(i, txn)| {
            let tm = Arc::clone(&tm);
            let txn = *txn;
            let next = ((i + 1) % 3) as u64;
            thread::spawn(move || {
                let result = tm.write(txn, users(next), Bytes::from("next"));
                if result.is_ok() {
                    tm.commit(txn)?;
                }
                result
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let victims = results
        .iter()
        .filter(|r| matches!(r, Err(TxnError::DeadlockVictim(_))))
        .count();
    assert_eq!(victims, 1, "{results:?}");
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    assert_eq!(tm.deadlock_history().len(), 1);
    assert_eq!(tm.active_count(), 0);
}

#[test]
fn test_cycle_through_queue_order_is_resolved() {
    let core = detecting_core();
    let tm = Arc::clone(core.tm());
    let r1 = ResourceId::row(users(1));
    let r2 = ResourceId::row(users(2));

    let t1 = tm.begin_default().unwrap();
    let t2 = tm.begin_default().unwrap();
    let t3 = tm.begin_default().unwrap();
    tm.lock(t1, r1, LockMode::Shared, None).unwrap();
    tm.lock(t3, r2, LockMode::Exclusive, None).unwrap();

    let spawn_lock = |txn: TxnId, resource: ResourceId, mode: LockMode| {
        let tm = Arc::clone(&tm);
        thread::spawn(move || {
            let result = tm.lock(txn, resource, mode, None).map(|_| ());
            if result.is_ok() {
                tm.commit(txn)?;
            }
            result
        })
    };
    // T2 IX waits on T1's S. T3 IS is compatible with both but queues
    // behind T2. T1 then closes the ring by waiting on T3's X.
    let h2 = spawn_lock(t2, r1, LockMode::IntentionExclusive);
    core.wait_until_blocked(t2);
    let h3 = spawn_lock(t3, r1, LockMode::IntentionShared);
    core.wait_until_blocked(t3);
    let h1 = spawn_lock(t1, r2, LockMode::Shared);

    let r1_result = h1.join().unwrap();
    let r2_result = h2.join().unwrap();
    let r3_result = h3.join().unwrap();

    assert!(r1_result.is_ok(), "{r1_result:?}");
    assert!(r2_result.is_ok(), "{r2_result:?}");
    assert!(
        matches!(r3_result, Err(TxnError::DeadlockVictim(_))),
        "{r3_result:?}"
    );
    assert_eq!(tm.state(t3), Some(TransactionState::Aborted));

    let history = tm.deadlock_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].victim, t3);
    let mut participants = history[0].participants.clone();
    participants.sort();
    assert_eq!(participants, vec![t1, t2, t3]);
    assert_eq!(tm.active_count(), 0);
}
