//! End-to-end transaction scenarios.
//!
//! Each test drives the transaction manager the way a SQL layer would:
//! begin, statements, row reads and writes, commit or rollback.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use txcore_common::types::{IsolationLevel, Lsn};
use txcore_common::ErrorCode;
use txcore_test::{users, TestCore};
use txcore_txn::{LockMode, ResourceId, RollbackOutcome, TransactionState, TxnError};

#[test]
fn test_basic_commit() {
    let core = TestCore::new();
    let tm = core.tm();

    let txn = tm.begin(IsolationLevel::ReadCommitted).unwrap();
    tm.begin_statement(txn).unwrap();
    tm.write(txn, users(1), Bytes::from("alice")).unwrap();
    tm.end_statement(txn).unwrap();
    let lsn = tm.commit(txn).unwrap();
    assert!(lsn.is_valid());
    assert!(tm.wal_status().flush_lsn >= lsn);

    let reader = tm.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("alice")));
    assert_eq!(tm.commit(reader).unwrap(), Lsn::INVALID);

    let status = tm.status();
    assert_eq!(status.transactions.committed, 2);
    assert!(status.active.is_empty());
    assert!(status.lock_tree.is_empty());
}

#[test]
fn test_repeatable_read_is_stable() {
    let core = TestCore::new();
    let tm = core.tm();

    let setup = tm.begin_default().unwrap();
    tm.write(setup, users(1), Bytes::from("v1")).unwrap();
    tm.commit(setup).unwrap();

    let reader = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("v1")));
    tm.end_statement(reader).unwrap();

    let writer = tm.begin_default().unwrap();
    tm.write(writer, users(1), Bytes::from("v2")).unwrap();
    tm.commit(writer).unwrap();

    tm.begin_statement(reader).unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("v1")));
    tm.commit(reader).unwrap();

    // A read committed reader sees the update at its next statement.
    let fresh = tm.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(tm.read(fresh, users(1)).unwrap(), Some(Bytes::from("v2")));
}

#[test]
fn test_read_uncommitted_sees_pending_write() {
    let core = TestCore::new();
    let tm = core.tm();

    let writer = tm.begin_default().unwrap();
    tm.write(writer, users(1), Bytes::from("dirty")).unwrap();

    let dirty = tm.begin(IsolationLevel::ReadUncommitted).unwrap();
    assert_eq!(tm.read(dirty, users(1)).unwrap(), Some(Bytes::from("dirty")));

    let clean = tm.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(tm.read(clean, users(1)).unwrap(), None);
    tm.abort(writer).unwrap();
}

#[test]
fn test_write_write_repeatable_read_last_writer_wins() {
    let core = TestCore::new();
    let tm = Arc::clone(core.tm());

    let setup = tm.begin_default().unwrap();
    tm.write(setup, users(1), Bytes::from("base")).unwrap();
    tm.commit(setup).unwrap();

    let first = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    let second = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    tm.write(first, users(1), Bytes::from("first")).unwrap();

    let handle = {
        let tm = Arc::clone(&tm);
        thread::spawn(move || {
            tm.write(second, users(1), Bytes::from("second"))?;
            tm.commit(second)
        })
    };
    core.wait_until_blocked(second);

    tm.commit(first).unwrap();
    handle.join().unwrap().unwrap();

    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("second")));
}

#[test]
fn test_write_write_serializable_first_committer_wins() {
    let core = TestCore::new();
    let tm = Arc::clone(core.tm());

    let setup = tm.begin_default().unwrap();
    tm.write(setup, users(1), Bytes::from("base")).unwrap();
    tm.commit(setup).unwrap();

    let first = tm.begin(IsolationLevel::Serializable).unwrap();
    let second = tm.begin(IsolationLevel::Serializable).unwrap();
    tm.write(first, users(1), Bytes::from("first")).unwrap();

    let handle = {
        let tm = Arc::clone(&tm);
        thread::spawn(move || {
            tm.write(second, users(1), Bytes::from("second"))?;
            tm.commit(second)
        })
    };
    core.wait_until_blocked(second);

    tm.commit(first).unwrap();
    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TxnError::SerializationFailure { .. }), "{err}");
    assert_eq!(err.code(), ErrorCode::SerializationFailure);
    assert!(err.is_retryable());
    assert_eq!(tm.state(second), Some(TransactionState::Aborted));

    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("first")));
}

#[test]
fn test_lock_timeout_scenario() {
    let core = TestCore::new();
    let tm = core.tm();

    let holder = tm.begin_default().unwrap();
    tm.lock(holder, ResourceId::row(users(1)), LockMode::Exclusive, None)
        .unwrap();

    let waiter = tm.begin_default().unwrap();
    let start = Instant::now();
    let err = tm
        .lock(
            waiter,
            ResourceId::row(users(1)),
            LockMode::Shared,
            Some(Duration::from_millis(100)),
        )
        .unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(matches!(err, TxnError::LockTimeout { .. }));

    // The request left nothing behind.
    let tree = tm.lock_tree();
    assert_eq!(tree.len(), 1);
    assert!(tree[0].waiters.is_empty());
    assert_eq!(tm.lock_manager().waiting_count(), 0);
    assert_eq!(tm.state(waiter), Some(TransactionState::Active));
}

#[test]
fn test_savepoint_scenario() {
    let core = TestCore::new();
    let tm = core.tm();

    let setup = tm.begin_default().unwrap();
    tm.write(setup, users(1), Bytes::from("original")).unwrap();
    tm.commit(setup).unwrap();

    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(2), Bytes::from("kept")).unwrap();
    tm.savepoint(txn, "before_update").unwrap();
    tm.write(txn, users(1), Bytes::from("changed")).unwrap();
    assert!(tm.delete(txn, users(2)).unwrap());

    assert_eq!(tm.rollback_to_savepoint(txn, "before_update").unwrap(), 2);
    assert_eq!(tm.read(txn, users(1)).unwrap(), Some(Bytes::from("original")));
    assert_eq!(tm.read(txn, users(2)).unwrap(), Some(Bytes::from("kept")));
    tm.commit(txn).unwrap();

    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("original")));
    assert_eq!(tm.read(reader, users(2)).unwrap(), Some(Bytes::from("kept")));
}

#[test]
fn test_admin_rollback_of_blocked_transaction() {
    let core = TestCore::new();
    let tm = Arc::clone(core.tm());

    let holder = tm.begin_default().unwrap();
    tm.write(holder, users(1), Bytes::from("held")).unwrap();

    let blocked = tm.begin_default().unwrap();
    tm.write(blocked, users(2), Bytes::from("own row")).unwrap();
    let handle = {
        let tm = Arc::clone(&tm);
        thread::spawn(move || tm.write(blocked, users(1), Bytes::from("waiting")))
    };
    core.wait_until_blocked(blocked);

    let waiting = tm
        .active_transactions()
        .into_iter()
        .find(|info| info.txn_id == blocked)
        .unwrap();
    assert!(waiting.waiting_on.is_some());

    assert_eq!(tm.force_rollback(blocked), RollbackOutcome::RolledBack);
    assert!(matches!(handle.join().unwrap(), Err(TxnError::Aborted(_))));
    assert_eq!(tm.state(blocked), Some(TransactionState::Aborted));
    assert_eq!(tm.force_rollback(blocked), RollbackOutcome::AlreadyAborted);

    // Its own write is gone and its locks are released.
    assert!(tm.lock_manager().locks_held(blocked).is_empty());
    tm.commit(holder).unwrap();
    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(2)).unwrap(), None);
}

#[test]
fn test_vacuum_respects_open_snapshot() {
    let core = TestCore::new();
    let tm = core.tm();

    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(1), Bytes::from("v1")).unwrap();
    tm.commit(txn).unwrap();

    let old = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(tm.read(old, users(1)).unwrap(), Some(Bytes::from("v1")));

    for value in ["v2", "v3"] {
        let txn = tm.begin_default().unwrap();
        tm.write(txn, users(1), Bytes::from(value)).unwrap();
        tm.commit(txn).unwrap();
    }

    // `old` can still read v1, so nothing may go.
    assert_eq!(tm.vacuum_now().versions_reclaimed, 0);
    assert_eq!(tm.row_versions(&users(1)).len(), 3);
    assert_eq!(tm.read(old, users(1)).unwrap(), Some(Bytes::from("v1")));

    tm.commit(old).unwrap();
    assert_eq!(tm.vacuum_now().versions_reclaimed, 2);
    assert_eq!(tm.row_versions(&users(1)).len(), 1);
    assert!(tm.mvcc_status().vacuum.runs >= 2);

    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("v3")));
}

#[test]
fn test_too_many_active_transactions() {
    let core = TestCore::with_config(|config| {
        config.deadlock.enabled = false;
        config.txn.max_active_transactions = 4;
    });
    let tm = core.tm();

    let open: Vec<_> = (0..4).map(|_| tm.begin_default().unwrap()).collect();
    let err = tm.begin_default().unwrap_err();
    assert!(matches!(err, TxnError::TooManyActiveTransactions { limit: 4 }));
    assert!(err.is_retryable());

    tm.abort(open[0]).unwrap();
    tm.begin_default().unwrap();
}

#[test]
fn test_status_json() {
    let core = TestCore::new();
    let tm = core.tm();

    let txn = tm.begin(IsolationLevel::Serializable).unwrap();
    tm.write(txn, users(1), Bytes::from("x")).unwrap();

    let json = serde_json::to_value(tm.status()).unwrap();
    assert_eq!(json["active"][0]["isolation"], "serializable");
    assert_eq!(json["active"][0]["rows_affected"], 1);
    assert!(json["lock_tree"].as_array().unwrap().len() >= 2);
    assert!(json["mvcc"]["vacuum"]["running"].is_boolean());
}
