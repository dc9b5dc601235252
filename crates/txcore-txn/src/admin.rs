//! Operator actions.

use std::collections::HashSet;

use txcore_common::types::{RowKey, TxnId};
use txcore_mvcc::VacuumResult;
use txcore_wal::SegmentSwitch;

use crate::deadlock::DeadlockEvent;
use crate::lock::ResourceId;
use crate::manager::{RollbackCause, RollbackOutcome, TransactionManager, TxnError, TxnResult};

/// True if releasing `resource` would expose one of `written`.
fn protects(resource: ResourceId, written: &HashSet<RowKey>) -> bool {
    match resource {
        ResourceId::Row(key) => written.contains(&key),
        ResourceId::Table(table) => written.iter().any(|key| key.table == table),
    }
}

impl TransactionManager {
    /// Rolls back a transaction on behalf of an operator.
    ///
    /// Idempotent and never fails. A transaction blocked on a lock is woken
    /// and its pending call returns [`crate::TxnError::Aborted`].
    pub fn force_rollback(&self, txn_id: TxnId) -> RollbackOutcome {
        let outcome = self.rollback(txn_id, RollbackCause::Admin);
        tracing::info!(txn = %txn_id, ?outcome, "administrative rollback");
        outcome
    }

    /// Releases one lock of a live transaction on behalf of an operator.
    ///
    /// Locks covering the transaction's uncommitted writes are refused.
    /// Returns false if the lock was not held.
    pub fn release_lock(&self, txn_id: TxnId, resource: ResourceId) -> TxnResult<bool> {
        let slot = self.slot(txn_id, "release a lock of")?;
        let body = slot.body.lock();
        let written: HashSet<RowKey> = body.writes.iter().map(|w| w.key).collect();
        if protects(resource, &written) {
            return Err(TxnError::LockProtectsWrites { txn_id, resource });
        }

        let released = self.locks.release(txn_id, resource);
        if released {
            tracing::info!(txn = %txn_id, %resource, "administrative lock release");
        }
        Ok(released)
    }

    /// Releases every lock of a live transaction that covers none of its
    /// uncommitted writes. Returns the number released.
    pub fn release_all_locks(&self, txn_id: TxnId) -> TxnResult<usize> {
        let slot = self.slot(txn_id, "release the locks of")?;
        let body = slot.body.lock();
        let written: HashSet<RowKey> = body.writes.iter().map(|w| w.key).collect();

        let mut released = 0;
        for (resource, _) in self.locks.locks_held(txn_id) {
            if !protects(resource, &written) && self.locks.release(txn_id, resource) {
                released += 1;
            }
        }
        tracing::info!(txn = %txn_id, released, "administrative release of all locks");
        Ok(released)
    }

    /// Seals the active WAL segment and continues in a new one.
    pub fn switch_wal_segment(&self) -> TxnResult<SegmentSwitch> {
        self.log.switch_segment().map_err(TxnError::Log)
    }

    /// Runs a vacuum pass immediately. Returns a skipped result if a pass
    /// is already running.
    pub fn vacuum_now(&self) -> VacuumResult {
        let result = self.vacuum.run();
        if result.did_work() {
            tracing::info!(
                reclaimed = result.versions_reclaimed,
                pruned = result.chains_pruned,
                horizon = %result.horizon,
                "vacuum pass finished"
            );
        }
        result
    }

    /// Runs a deadlock detection pass immediately and returns the
    /// deadlocks it resolved.
    pub fn detect_deadlocks_now(&self) -> Vec<DeadlockEvent> {
        self.detector.detect_now()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use tempfile::TempDir;
    use txcore_common::config::CoreConfig;
    use txcore_common::types::{IsolationLevel, RowKey, TableId};

    use crate::lock::LockMode;
    use crate::manager::TransactionState;

    use super::*;

    fn manager(dir: &TempDir) -> Arc<TransactionManager> {
        let mut config = CoreConfig::for_testing(dir.path());
        config.deadlock.enabled = false;
        TransactionManager::open(&config).unwrap().0
    }

    fn key(row: u64) -> RowKey {
        RowKey::new(TableId::new(3), row)
    }

    #[test]
    fn test_vacuum_waits_for_old_snapshot() {
        let tmp = TempDir::new().unwrap();
        let tm = manager(&tmp);

        let txn = tm.begin_default().unwrap();
        tm.write(txn, key(1), Bytes::from("v1")).unwrap();
        tm.commit(txn).unwrap();

        let old_reader = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(tm.read(old_reader, key(1)).unwrap(), Some(Bytes::from("v1")));

        let txn = tm.begin_default().unwrap();
        tm.write(txn, key(1), Bytes::from("v2")).unwrap();
        tm.commit(txn).unwrap();

        let result = tm.vacuum_now();
        assert_eq!(result.versions_reclaimed, 0);
        assert_eq!(tm.row_versions(&key(1)).len(), 2);
        assert_eq!(tm.read(old_reader, key(1)).unwrap(), Some(Bytes::from("v1")));

        tm.commit(old_reader).unwrap();
        let result = tm.vacuum_now();
        assert_eq!(result.versions_reclaimed, 1);
        assert_eq!(tm.row_versions(&key(1)).len(), 1);
    }

    #[test]
    fn test_detect_deadlocks_now_picks_one_victim() {
        let tmp = TempDir::new().unwrap();
        let tm = manager(&tmp);

        let t1 = tm.begin_default().unwrap();
        let t2 = tm.begin_default().unwrap();
        tm.write(t1, key(1), Bytes::from("t1")).unwrap();
        tm.write(t2, key(2), Bytes::from("t2")).unwrap();

        let h1 = {
            let tm = Arc::clone(&tm);
            thread::spawn(move || tm.write(t1, key(2), Bytes::from("t1")))
        };
        let h2 = {
            let tm = Arc::clone(&tm);
            thread::spawn(move || tm.write(t2, key(1), Bytes::from("t2")))
        };

        let start = Instant::now();
        while tm.lock_wait_graph().cycles.is_empty() {
            assert!(start.elapsed() < Duration::from_secs(5), "cycle never formed");
            thread::sleep(Duration::from_millis(1));
        }

        let events = tm.detect_deadlocks_now();
        assert_eq!(events.len(), 1);
        // The younger transaction loses.
        assert_eq!(events[0].victim, t2);

        assert!(matches!(h2.join().unwrap(), Err(TxnError::DeadlockVictim(_))));
        h1.join().unwrap().unwrap();
        tm.commit(t1).unwrap();

        assert_eq!(tm.state(t2), Some(TransactionState::Aborted));
        assert_eq!(tm.deadlock_history().len(), 1);
        assert_eq!(tm.stats().snapshot().deadlock_victims, 1);
    }

    #[test]
    fn test_release_lock_refuses_locks_covering_writes() {
        let tmp = TempDir::new().unwrap();
        let tm = manager(&tmp);

        let txn = tm.begin_default().unwrap();
        tm.write(txn, key(1), Bytes::from("x")).unwrap();
        tm.lock(txn, ResourceId::row(key(2)), LockMode::Shared, None)
            .unwrap();

        for resource in [ResourceId::row(key(1)), ResourceId::table(TableId::new(3))] {
            assert!(matches!(
                tm.release_lock(txn, resource),
                Err(TxnError::LockProtectsWrites { .. })
            ));
        }
        assert!(tm.release_lock(txn, ResourceId::row(key(2))).unwrap());
        assert!(!tm.release_lock(txn, ResourceId::row(key(2))).unwrap());
        assert_eq!(tm.release_all_locks(txn).unwrap(), 0);

        tm.commit(txn).unwrap();
        assert!(matches!(
            tm.release_lock(txn, ResourceId::row(key(1))),
            Err(TxnError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_release_all_locks_unblocks_waiter() {
        let tmp = TempDir::new().unwrap();
        let tm = manager(&tmp);

        let reader = tm.begin_default().unwrap();
        for row in [1, 2] {
            tm.lock(reader, ResourceId::row(key(row)), LockMode::Shared, None)
                .unwrap();
        }
        let writer = tm.begin_default().unwrap();
        let handle = {
            let tm = Arc::clone(&tm);
            thread::spawn(move || tm.write(writer, key(1), Bytes::from("w")))
        };
        let start = Instant::now();
        while tm.lock_manager().waiting_on(writer).is_none() {
            assert!(start.elapsed() < Duration::from_secs(5), "writer never blocked");
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(tm.release_all_locks(reader).unwrap(), 2);
        handle.join().unwrap().unwrap();
        tm.commit(writer).unwrap();

        // The reader itself is untouched.
        assert_eq!(tm.state(reader), Some(TransactionState::Active));
        tm.commit(reader).unwrap();
    }

    #[test]
    fn test_switch_wal_segment() {
        let tmp = TempDir::new().unwrap();
        let tm = manager(&tmp);

        let txn = tm.begin_default().unwrap();
        tm.write(txn, key(1), Bytes::from("x")).unwrap();
        tm.commit(txn).unwrap();

        let before = tm.wal_segments().unwrap();
        let switch = tm.switch_wal_segment().unwrap();
        assert_eq!(
            switch.previous,
            before.iter().find(|s| s.active).map(|s| s.segment_id)
        );

        let after = tm.wal_segments().unwrap();
        assert_eq!(after.len(), before.len() + 1);
        let newest = after.last().unwrap();
        assert_eq!(newest.segment_id, switch.current);
        assert!(newest.active);
        assert_eq!(after.iter().filter(|s| s.active).count(), 1);
    }

    #[test]
    fn test_force_rollback_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let tm = manager(&tmp);

        let txn = tm.begin_default().unwrap();
        tm.write(txn, key(1), Bytes::from("x")).unwrap();
        assert_eq!(tm.force_rollback(txn), RollbackOutcome::RolledBack);
        assert_eq!(tm.force_rollback(txn), RollbackOutcome::AlreadyAborted);
        assert!(tm.active_transactions().is_empty());
        assert_eq!(tm.lock_manager().lock_count(), 0);
    }
}
