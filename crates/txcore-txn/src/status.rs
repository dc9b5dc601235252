//! Read-only introspection of the transaction core.
//!
//! Every view is a plain serializable struct built from point-in-time
//! copies; nothing here blocks a running transaction for longer than a
//! table read.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use serde::Serialize;

use txcore_common::types::{IsolationLevel, Lsn, RowKey, Timestamp, TxnId, WallTime};
use txcore_mvcc::{SnapshotInfo, VacuumProgress, VersionInfo, VersionStoreStats};
use txcore_wal::{SegmentInfo, WalStatsSnapshot};

use crate::deadlock::{DeadlockEvent, DeadlockStatsSnapshot, WaitForGraph};
use crate::lock::{LockMode, LockStatsSnapshot, LockTreeNode, ResourceId, WaitEdge, WaitingOn};
use crate::manager::{
    FinishedTransaction, TransactionManager, TransactionState, TransactionStatsSnapshot, TxnError,
    TxnResult, TxnSlot,
};

/// A live transaction.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTransactionInfo {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Current state.
    pub state: TransactionState,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Begin time.
    pub started_at: WallTime,
    /// Time since begin, in milliseconds.
    pub duration_ms: u64,
    /// Locks held.
    pub locks: Vec<HeldLock>,
    /// Statements started.
    pub statements: u64,
    /// Rows written or deleted.
    pub rows_affected: u64,
    /// Pending writes.
    pub pending_writes: usize,
    /// Last WAL record written by the transaction.
    pub last_lsn: Lsn,
    /// Snapshot timestamp, if one is taken.
    pub snapshot_ts: Option<Timestamp>,
    /// Lock request the transaction is blocked on.
    pub waiting_on: Option<WaitingOn>,
}

/// A lock held by a transaction.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeldLock {
    /// Locked resource.
    pub resource: ResourceId,
    /// Held mode.
    pub mode: LockMode,
}

/// Current wait-for relationships.
#[derive(Debug, Clone, Serialize)]
pub struct LockWaitGraph {
    /// Waiter to holder edges.
    pub edges: Vec<WaitEdge>,
    /// Cycles present right now.
    pub cycles: Vec<Vec<TxnId>>,
}

/// MVCC state.
#[derive(Debug, Clone, Serialize)]
pub struct MvccStatus {
    /// Current logical clock value.
    pub clock: Timestamp,
    /// Oldest timestamp a live snapshot can read at.
    pub oldest_snapshot: Timestamp,
    /// Transactions known to the snapshot manager.
    pub active_transactions: usize,
    /// Transactions holding a snapshot.
    pub active_snapshots: usize,
    /// Committed write sets kept for serializable validation.
    pub retained_write_sets: usize,
    /// Version store counters.
    pub versions: VersionStoreStats,
    /// Vacuum progress.
    pub vacuum: VacuumProgress,
}

/// Everything the core can report, in one value.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// When the status was taken.
    pub taken_at: WallTime,
    /// Transaction counters.
    pub transactions: TransactionStatsSnapshot,
    /// Live transactions.
    pub active: Vec<ActiveTransactionInfo>,
    /// Recently finished transactions, oldest first.
    pub recent: Vec<FinishedTransaction>,
    /// Lock counters.
    pub locks: LockStatsSnapshot,
    /// Locked resources with holders and waiters.
    pub lock_tree: Vec<LockTreeNode>,
    /// Wait-for edges and cycles.
    pub lock_wait_graph: LockWaitGraph,
    /// Deadlock detector counters.
    pub deadlocks: DeadlockStatsSnapshot,
    /// Recently resolved deadlocks.
    pub deadlock_history: Vec<DeadlockEvent>,
    /// MVCC state.
    pub mvcc: MvccStatus,
    /// Live snapshots.
    pub snapshots: Vec<SnapshotInfo>,
    /// WAL counters.
    pub wal: WalStatsSnapshot,
}

impl TransactionManager {
    /// Returns the live transactions ordered by id.
    pub fn active_transactions(&self) -> Vec<ActiveTransactionInfo> {
        let slots: Vec<Arc<TxnSlot>> = self.live.read().values().cloned().collect();
        let mut infos: Vec<_> = slots.iter().map(|slot| self.describe(slot)).collect();
        infos.sort_by_key(|info| info.txn_id);
        infos
    }

    fn describe(&self, slot: &TxnSlot) -> ActiveTransactionInfo {
        let (pending_writes, last_lsn) = {
            let body = slot.body.lock();
            (body.writes.len(), body.last_lsn)
        };
        ActiveTransactionInfo {
            txn_id: slot.id,
            state: slot.state(),
            isolation: slot.isolation(),
            started_at: slot.started_wall,
            duration_ms: slot.started_at.elapsed().as_millis() as u64,
            locks: self
                .locks
                .locks_held(slot.id)
                .into_iter()
                .map(|(resource, mode)| HeldLock { resource, mode })
                .collect(),
            statements: slot.statements.load(AtomicOrdering::Relaxed),
            rows_affected: slot.rows_affected.load(AtomicOrdering::Relaxed),
            pending_writes,
            last_lsn,
            snapshot_ts: self.snapshots.snapshot_of(slot.id).map(|s| s.ts()),
            waiting_on: self.locks.waiting_on(slot.id),
        }
    }

    /// Returns recently finished transactions, oldest first.
    pub fn recent_transactions(&self) -> Vec<FinishedTransaction> {
        self.finished.lock().iter().cloned().collect()
    }

    /// Returns every locked resource with its holders and waiters.
    pub fn lock_tree(&self) -> Vec<LockTreeNode> {
        self.locks.lock_tree()
    }

    /// Returns the wait-for edges and the cycles they currently form.
    pub fn lock_wait_graph(&self) -> LockWaitGraph {
        let edges = self.locks.wait_for_edges();
        let cycles = WaitForGraph::from_edges(&edges).cycles();
        LockWaitGraph { edges, cycles }
    }

    /// Returns recently resolved deadlocks, oldest first.
    pub fn deadlock_history(&self) -> Vec<DeadlockEvent> {
        self.detector.history()
    }

    /// Returns the MVCC state.
    pub fn mvcc_status(&self) -> MvccStatus {
        MvccStatus {
            clock: self.clock.read(),
            oldest_snapshot: self.snapshots.oldest_active_snapshot(),
            active_transactions: self.snapshots.active_count(),
            active_snapshots: self.snapshots.active_snapshot_count(),
            retained_write_sets: self.snapshots.retained_write_sets(),
            versions: self.store.stats(),
            vacuum: self.vacuum.progress(),
        }
    }

    /// Returns WAL counters.
    pub fn wal_status(&self) -> WalStatsSnapshot {
        self.log.stats()
    }

    /// Lists the WAL segment files, oldest first.
    pub fn wal_segments(&self) -> TxnResult<Vec<SegmentInfo>> {
        self.log.segments().map_err(TxnError::Log)
    }

    /// Returns the live snapshots.
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots.snapshots()
    }

    /// Returns every stored version of a row, newest first.
    pub fn row_versions(&self, key: &RowKey) -> Vec<VersionInfo> {
        self.store.row_versions(key)
    }

    /// Returns the full status.
    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            taken_at: WallTime::now(),
            transactions: self.stats().snapshot(),
            active: self.active_transactions(),
            recent: self.recent_transactions(),
            locks: self.locks.stats().snapshot(),
            lock_tree: self.lock_tree(),
            lock_wait_graph: self.lock_wait_graph(),
            deadlocks: self.detector.stats().snapshot(),
            deadlock_history: self.deadlock_history(),
            mvcc: self.mvcc_status(),
            snapshots: self.snapshots(),
            wal: self.wal_status(),
        }
    }
}
