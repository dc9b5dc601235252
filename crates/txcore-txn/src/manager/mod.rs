//! Transaction manager for coordinating transaction lifecycle.
//!
//! This module provides the core transaction management functionality:
//! - Transaction lifecycle (begin, statements, commit, abort)
//! - Integration with the MVCC version store and snapshot manager
//! - Integration with the WAL for durability
//! - Lock acquisition and release
//! - Savepoints and partial rollback
//! - Deadlock victim rollback and recovery from the WAL
//!
//! # Transaction States
//!
//! ```text
//!                          begin_statement()
//! ┌───────┐  begin()  ┌────────┐ ◀──────── ┌───────────────────┐
//! │ Start │──────────▶│ Active │           │ IdleInTransaction │
//! └───────┘           └────────┘ ────────▶ └───────────────────┘
//!                      │      │  end_statement()     │      │
//!             commit() │      │ abort()              │      │
//!                      ▼      ▼                      │      │
//!             ┌────────────┐ ┌──────────┐            │      │
//!             │ Committing │ │ Aborting │◀───────────┘      │
//!             └────────────┘ └──────────┘                   │
//!                   │             │         commit()        │
//!                   ▼             ▼     (via Committing)    │
//!             ┌───────────┐ ┌─────────┐                     │
//!             │ Committed │ │ Aborted │ ◀───────────────────┘
//!             └───────────┘ └─────────┘
//! ```
//!
//! A failed commit moves `Committing` to `Aborting`; nothing else leaves
//! `Committing` or `Aborting` except their terminal states.
//!
//! # Locking
//!
//! A transaction's body mutex is never held while it blocks on a row lock,
//! so rollback from another thread (deadlock victim or operator) can always
//! make progress. Every operation re-checks the state after it acquires
//! its locks.

mod error;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use txcore_common::config::{CoreConfig, TxnConfig};
use txcore_common::types::{IsolationLevel, Lsn, RowKey, TableId, Timestamp, TxnId, WallTime};
use txcore_mvcc::{
    LogicalClock, SnapshotManager, Vacuum, VacuumConfig, VersionStore, WriteEntry, WriteKind,
};
use txcore_wal::{
    CommitLog, CommitPayload, CompensationPayload, DeletePayload, InsertPayload, RecoveryReport,
    RedoOp, UpdatePayload, Wal, WalConfig, WalPayload,
};

use crate::deadlock::{DeadlockDetector, DeadlockDetectorConfig, DetectorHandle, VictimHandler};
use crate::lock::{
    CancelReason, Escalation, LockError, LockGrant, LockManager, LockManagerConfig, LockMode,
    ResourceId,
};

pub use error::{TxnError, TxnResult};

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransactionState {
    /// A statement is running.
    Active = 0,
    /// Between statements.
    IdleInTransaction = 1,
    /// Commit in progress.
    Committing = 2,
    /// Transaction has been committed.
    Committed = 3,
    /// Rollback in progress.
    Aborting = 4,
    /// Transaction has been aborted.
    Aborted = 5,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::IdleInTransaction,
            2 => Self::Committing,
            3 => Self::Committed,
            4 => Self::Aborting,
            _ => Self::Aborted,
        }
    }

    /// Returns true if the transaction can run statements.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::IdleInTransaction)
    }

    /// Returns true if the transaction has ended.
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Returns the snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::IdleInTransaction => "idle_in_transaction",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a rollback requested from outside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// The transaction was live and has been rolled back.
    RolledBack,
    /// The transaction had already been aborted.
    AlreadyAborted,
    /// The transaction had already committed.
    AlreadyCommitted,
    /// The transaction is committing and can no longer be rolled back.
    CommitInProgress,
    /// No such transaction is known.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RollbackCause {
    User,
    DeadlockVictim,
    Admin,
}

#[derive(Debug, Clone)]
struct Savepoint {
    name: String,
    /// Length of the write set when the savepoint was taken.
    write_len: usize,
    /// Last WAL record of the transaction at that point.
    wal_lsn: Lsn,
}

#[derive(Debug, Default)]
pub(crate) struct TxnBody {
    pub(crate) writes: Vec<WriteEntry>,
    savepoints: Vec<Savepoint>,
    pub(crate) last_lsn: Lsn,
}

/// A live transaction.
pub(crate) struct TxnSlot {
    pub(crate) id: TxnId,
    isolation: Mutex<IsolationLevel>,
    /// Set once the transaction has run anything; fixes the isolation level.
    pinned: AtomicBool,
    pub(crate) started_at: Instant,
    pub(crate) started_wall: WallTime,
    state: AtomicU8,
    pub(crate) statements: AtomicU64,
    pub(crate) rows_affected: AtomicU64,
    victim: AtomicBool,
    pub(crate) body: Mutex<TxnBody>,
}

impl TxnSlot {
    fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation: Mutex::new(isolation),
            pinned: AtomicBool::new(false),
            started_at: Instant::now(),
            started_wall: WallTime::now(),
            state: AtomicU8::new(TransactionState::Active as u8),
            statements: AtomicU64::new(0),
            rows_affected: AtomicU64::new(0),
            victim: AtomicBool::new(false),
            body: Mutex::new(TxnBody::default()),
        }
    }

    pub(crate) fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    /// Moves to `to` if the current state is one of `from`. Returns the
    /// state found otherwise.
    fn transition(
        &self,
        from: &[TransactionState],
        to: TransactionState,
    ) -> Result<(), TransactionState> {
        let mut current = self.state();
        loop {
            if !from.contains(&current) {
                return Err(current);
            }
            match self.state.compare_exchange(
                current as u8,
                to as u8,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(found) => current = TransactionState::from_u8(found),
            }
        }
    }

    fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, AtomicOrdering::Release);
    }

    pub(crate) fn is_victim(&self) -> bool {
        self.victim.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn isolation(&self) -> IsolationLevel {
        *self.isolation.lock()
    }

    fn pin(&self) {
        self.pinned.store(true, AtomicOrdering::Release);
    }
}

/// A transaction that ended recently.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedTransaction {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Final state.
    pub state: TransactionState,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Begin time.
    pub started_at: WallTime,
    /// End time.
    pub finished_at: WallTime,
    /// Lifetime in milliseconds.
    pub duration_ms: u64,
    /// Statements run.
    pub statements: u64,
    /// Rows written or deleted.
    pub rows_affected: u64,
    /// Rolled back to break a deadlock.
    pub deadlock_victim: bool,
    /// Commit timestamp for committed transactions that wrote.
    pub commit_ts: Option<Timestamp>,
}

/// Configuration for the transaction manager.
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    /// Default isolation level for new transactions.
    pub default_isolation: IsolationLevel,
    /// Maximum number of live transactions.
    pub max_active_transactions: usize,
    /// Finished transactions remembered for status and idempotent rollback.
    pub finished_history: usize,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self::from(&TxnConfig::default())
    }
}

impl From<&TxnConfig> for TransactionManagerConfig {
    fn from(config: &TxnConfig) -> Self {
        Self {
            default_isolation: config.default_isolation,
            max_active_transactions: config.max_active_transactions,
            finished_history: config.finished_history,
        }
    }
}

impl TransactionManagerConfig {
    /// Sets the live transaction limit.
    #[must_use]
    pub fn with_max_active_transactions(mut self, limit: usize) -> Self {
        self.max_active_transactions = limit;
        self
    }

    /// Sets the default isolation level.
    #[must_use]
    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }
}

/// Statistics about the transaction manager.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Total transactions started.
    pub begun: AtomicU64,
    /// Total transactions committed.
    pub committed: AtomicU64,
    /// Total transactions aborted.
    pub aborted: AtomicU64,
    /// Transactions rolled back as deadlock victims.
    pub deadlock_victims: AtomicU64,
    /// Commits rejected by serializable validation.
    pub serialization_failures: AtomicU64,
    /// Operations failed by the WAL.
    pub wal_failures: AtomicU64,
    /// Rollbacks requested by an operator.
    pub admin_rollbacks: AtomicU64,
}

impl TransactionStats {
    /// Returns a serializable copy.
    pub fn snapshot(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            begun: self.begun.load(AtomicOrdering::Relaxed),
            committed: self.committed.load(AtomicOrdering::Relaxed),
            aborted: self.aborted.load(AtomicOrdering::Relaxed),
            deadlock_victims: self.deadlock_victims.load(AtomicOrdering::Relaxed),
            serialization_failures: self.serialization_failures.load(AtomicOrdering::Relaxed),
            wal_failures: self.wal_failures.load(AtomicOrdering::Relaxed),
            admin_rollbacks: self.admin_rollbacks.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransactionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStatsSnapshot {
    /// Total transactions started.
    pub begun: u64,
    /// Total transactions committed.
    pub committed: u64,
    /// Total transactions aborted.
    pub aborted: u64,
    /// Transactions rolled back as deadlock victims.
    pub deadlock_victims: u64,
    /// Commits rejected by serializable validation.
    pub serialization_failures: u64,
    /// Operations failed by the WAL.
    pub wal_failures: u64,
    /// Rollbacks requested by an operator.
    pub admin_rollbacks: u64,
}

/// The transaction manager coordinates all transaction operations.
pub struct TransactionManager {
    pub(crate) clock: Arc<LogicalClock>,
    pub(crate) store: Arc<VersionStore>,
    pub(crate) snapshots: Arc<SnapshotManager>,
    pub(crate) vacuum: Vacuum,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) detector: Arc<DeadlockDetector>,
    detector_handle: Mutex<Option<DetectorHandle>>,
    pub(crate) log: Arc<dyn CommitLog>,
    pub(crate) live: RwLock<HashMap<TxnId, Arc<TxnSlot>>>,
    pub(crate) finished: Mutex<VecDeque<FinishedTransaction>>,
    config: TransactionManagerConfig,
    stats: TransactionStats,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// Opens the core described by `config`: recovers the WAL, installs
    /// the recovered rows and starts the deadlock detector if enabled.
    pub fn open(config: &CoreConfig) -> TxnResult<(Arc<Self>, RecoveryReport)> {
        config.validate()?;
        let (wal, report) =
            Wal::recover(WalConfig::from(&config.wal)).map_err(TxnError::Recovery)?;
        let manager = Self::with_components(config, Arc::new(wal));
        manager.restore(&report)?;
        if config.deadlock.enabled {
            manager.start_deadlock_detector()?;
        }
        Ok((manager, report))
    }

    /// Builds a manager over an existing log. Nothing is recovered and no
    /// background thread is started.
    pub fn with_components(config: &CoreConfig, log: Arc<dyn CommitLog>) -> Arc<Self> {
        let clock = Arc::new(LogicalClock::new());
        let store = Arc::new(VersionStore::new());
        let snapshots = Arc::new(SnapshotManager::new(Arc::clone(&clock)));
        let vacuum = Vacuum::with_config(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            VacuumConfig::from(&config.mvcc),
        );
        let locks = Arc::new(LockManager::with_config(LockManagerConfig::from(
            &config.lock,
        )));
        let detector = Arc::new(DeadlockDetector::new(
            Arc::clone(&locks),
            DeadlockDetectorConfig::from(&config.deadlock),
        ));

        let manager = Arc::new(Self {
            clock,
            store,
            snapshots,
            vacuum,
            locks,
            detector,
            detector_handle: Mutex::new(None),
            log,
            live: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            config: TransactionManagerConfig::from(&config.txn),
            stats: TransactionStats::default(),
            next_txn_id: AtomicU64::new(TxnId::MIN.as_u64()),
        });
        let handler: Weak<dyn VictimHandler> = Arc::downgrade(&manager) as Weak<TransactionManager>;
        manager.detector.set_handler(handler);
        manager
    }

    /// Starts the background deadlock detector. No-op if it runs already.
    pub fn start_deadlock_detector(&self) -> TxnResult<()> {
        let mut handle = self.detector_handle.lock();
        if handle.is_none() {
            *handle = Some(self.detector.start().map_err(|source| TxnError::Spawn {
                name: "deadlock detector",
                source,
            })?);
        }
        Ok(())
    }

    /// Installs committed transactions recovered from the WAL.
    ///
    /// Transactions are applied in commit order, each getting a fresh
    /// commit timestamp. The id counter and the clock are advanced past
    /// everything the log contains.
    pub fn restore(&self, report: &RecoveryReport) -> TxnResult<()> {
        for txn in &report.committed {
            let mut writes = Vec::with_capacity(txn.ops.len());
            for op in &txn.ops {
                match op {
                    RedoOp::Put { key, value } => {
                        writes.push(self.store.write(*key, txn.txn_id, value.clone())?);
                    }
                    RedoOp::Delete { key } => {
                        if let Some(entry) = self.store.delete(*key, txn.txn_id)? {
                            writes.push(entry);
                        }
                    }
                }
            }
            let commit_ts = self.clock.tick();
            self.store.commit(&writes, commit_ts);
        }

        self.clock.advance_to(report.max_commit_ts);
        self.next_txn_id
            .fetch_max(report.max_txn_id.as_u64() + 1, AtomicOrdering::SeqCst);

        if !report.is_empty() {
            tracing::info!(
                transactions = report.committed.len(),
                operations = report.redo_op_count(),
                rows = self.store.key_count(),
                clock = %self.clock.read(),
                "restored committed transactions from WAL"
            );
        }
        Ok(())
    }

    /// Begins a new transaction with the default isolation level.
    pub fn begin_default(&self) -> TxnResult<TxnId> {
        self.begin(self.config.default_isolation)
    }

    /// Begins a new transaction with a specific isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> TxnResult<TxnId> {
        let mut live = self.live.write();
        if live.len() >= self.config.max_active_transactions {
            return Err(TxnError::TooManyActiveTransactions {
                limit: self.config.max_active_transactions,
            });
        }

        let txn_id = TxnId::new(self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst));
        self.locks.register(txn_id);
        self.snapshots.register(txn_id, isolation);
        if let Err(err) = self.snapshots.take_snapshot(txn_id) {
            self.locks.release_all(txn_id);
            self.snapshots.finish(txn_id);
            return Err(err.into());
        }
        live.insert(txn_id, Arc::new(TxnSlot::new(txn_id, isolation)));

        self.stats.begun.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(txn = %txn_id, %isolation, "transaction started");
        Ok(txn_id)
    }

    /// Starts a statement. Under `ReadCommitted` this takes a fresh
    /// snapshot.
    pub fn begin_statement(&self, txn_id: TxnId) -> TxnResult<()> {
        let slot = self.slot(txn_id, "begin statement in")?;
        slot.transition(
            &[TransactionState::Active, TransactionState::IdleInTransaction],
            TransactionState::Active,
        )
        .map_err(|state| self.unusable(&slot, state, "begin statement in"))?;
        self.start_statement(&slot)
    }

    /// Ends the running statement. No-op when no statement runs.
    pub fn end_statement(&self, txn_id: TxnId) -> TxnResult<()> {
        let slot = self.slot(txn_id, "end statement in")?;
        match slot.transition(
            &[TransactionState::Active],
            TransactionState::IdleInTransaction,
        ) {
            Ok(()) | Err(TransactionState::IdleInTransaction) => Ok(()),
            Err(state) => Err(self.unusable(&slot, state, "end statement in")),
        }
    }

    /// Changes the isolation level of a transaction that has not run
    /// anything yet. Its snapshot is retaken under the new level.
    pub fn set_isolation_level(&self, txn_id: TxnId, isolation: IsolationLevel) -> TxnResult<()> {
        let slot = self.slot(txn_id, "set isolation level of")?;
        let _body = slot.body.lock();
        self.ensure_open(&slot, "set isolation level of")?;
        if slot.pinned.load(AtomicOrdering::Acquire) {
            return Err(TxnError::IsolationLevelFixed(txn_id));
        }

        self.snapshots.set_isolation(txn_id, isolation)?;
        *slot.isolation.lock() = isolation;
        tracing::debug!(txn = %txn_id, %isolation, "isolation level changed");
        Ok(())
    }

    /// Reads the version of `key` visible to the transaction. Takes no
    /// locks.
    pub fn read(&self, txn_id: TxnId, key: RowKey) -> TxnResult<Option<Bytes>> {
        let slot = self.slot(txn_id, "read in")?;
        self.enter_statement(&slot, "read in")?;

        let snapshot = self
            .snapshots
            .snapshot_of(txn_id)
            .ok_or_else(|| self.ended_error(txn_id, "read in"))?;
        self.snapshots.record_read(txn_id, key);
        Ok(self.store.read(&key, &snapshot))
    }

    /// Writes a new version of `key`.
    pub fn write(&self, txn_id: TxnId, key: RowKey, value: Bytes) -> TxnResult<()> {
        self.write_row(txn_id, key, Some(value), "write in").map(|_| ())
    }

    /// Deletes `key`. Returns false if the row does not exist.
    pub fn delete(&self, txn_id: TxnId, key: RowKey) -> TxnResult<bool> {
        self.write_row(txn_id, key, None, "delete in")
    }

    fn write_row(
        &self,
        txn_id: TxnId,
        key: RowKey,
        value: Option<Bytes>,
        operation: &'static str,
    ) -> TxnResult<bool> {
        let slot = self.slot(txn_id, operation)?;
        self.enter_statement(&slot, operation)?;

        self.acquire(&slot, ResourceId::table(key.table), LockMode::IntentionExclusive, None)?;
        self.acquire(&slot, ResourceId::row(key), LockMode::Exclusive, None)?;

        let mut body = slot.body.lock();
        self.ensure_open(&slot, operation)?;
        // An operator may have released the row lock since it was granted.
        let row = ResourceId::row(key);
        if !self.locks.holds(txn_id, row, LockMode::Exclusive) {
            return Err(TxnError::LockReleased {
                txn_id,
                resource: row,
            });
        }

        let (entry, payload) = match value {
            Some(value) => {
                let entry = self.store.write(key, txn_id, value.clone())?;
                let payload = match entry.kind {
                    WriteKind::Update => WalPayload::Update(UpdatePayload { key, value }),
                    WriteKind::Insert | WriteKind::Delete => {
                        WalPayload::Insert(InsertPayload { key, value })
                    }
                };
                (entry, payload)
            }
            None => match self.store.delete(key, txn_id)? {
                Some(entry) => (entry, WalPayload::Delete(DeletePayload { key })),
                None => return Ok(false),
            },
        };

        match self.log.append(txn_id, payload) {
            Ok(lsn) => {
                body.last_lsn = lsn;
                body.writes.push(entry);
                slot.rows_affected.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(true)
            }
            Err(err) => {
                self.store.rollback(std::slice::from_ref(&entry));
                self.stats.wal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                tracing::error!(txn = %txn_id, %key, error = %err, "WAL append failed, aborting");
                self.abort_after_wal_failure(&slot, &mut body);
                Err(TxnError::WalWriteFailure(err))
            }
        }
    }

    /// Acquires a lock on behalf of the transaction.
    pub fn lock(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> TxnResult<LockGrant> {
        let slot = self.slot(txn_id, "lock in")?;
        self.ensure_open(&slot, "lock in")?;
        slot.pin();
        self.acquire(&slot, resource, mode, timeout)
    }

    /// Replaces the transaction's row locks on `table` with one table lock
    /// if that needs no wait. See [`LockManager::escalate`].
    pub fn escalate_locks(&self, txn_id: TxnId, table: TableId) -> TxnResult<Option<Escalation>> {
        let slot = self.slot(txn_id, "escalate locks in")?;
        self.ensure_open(&slot, "escalate locks in")?;
        self.locks
            .escalate(txn_id, table)
            .map_err(|err| lock_error(&slot, err))
    }

    /// Releases a lock early. Returns false if it was not held.
    pub fn unlock(&self, txn_id: TxnId, resource: ResourceId) -> TxnResult<bool> {
        let slot = self.slot(txn_id, "unlock in")?;
        self.ensure_open(&slot, "unlock in")?;
        Ok(self.locks.release(txn_id, resource))
    }

    fn acquire(
        &self,
        slot: &TxnSlot,
        resource: ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> TxnResult<LockGrant> {
        self.locks
            .acquire(slot.id, resource, mode, timeout)
            .map_err(|err| lock_error(slot, err))
    }

    /// Marks a savepoint at the current end of the write set. A name used
    /// twice refers to the newest savepoint.
    pub fn savepoint(&self, txn_id: TxnId, name: &str) -> TxnResult<()> {
        let slot = self.slot(txn_id, "create savepoint in")?;
        let mut body = slot.body.lock();
        self.ensure_open(&slot, "create savepoint in")?;

        let savepoint = Savepoint {
            name: name.to_string(),
            write_len: body.writes.len(),
            wal_lsn: body.last_lsn,
        };
        body.savepoints.push(savepoint);
        Ok(())
    }

    /// Undoes every write made after the savepoint. The savepoint itself
    /// stays, later ones are dropped, and locks are kept. Returns the
    /// number of writes undone.
    pub fn rollback_to_savepoint(&self, txn_id: TxnId, name: &str) -> TxnResult<usize> {
        let slot = self.slot(txn_id, "roll back savepoint in")?;
        let mut body = slot.body.lock();
        self.ensure_open(&slot, "roll back savepoint in")?;

        let index = find_savepoint(&body, txn_id, name)?;
        let Savepoint {
            write_len, wal_lsn, ..
        } = body.savepoints[index].clone();
        body.savepoints.truncate(index + 1);

        if body.writes.len() <= write_len {
            return Ok(0);
        }

        // Replay must learn about the undo before the versions go away.
        let compensation = WalPayload::Compensation(CompensationPayload { undo_to: wal_lsn });
        match self.log.append(txn_id, compensation) {
            Ok(lsn) => body.last_lsn = lsn,
            Err(err) => {
                self.stats.wal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                tracing::error!(txn = %txn_id, error = %err, "compensation record failed, aborting");
                self.abort_after_wal_failure(&slot, &mut body);
                return Err(TxnError::WalWriteFailure(err));
            }
        }

        let undone = body.writes.split_off(write_len);
        self.store.rollback(&undone);
        tracing::debug!(txn = %txn_id, savepoint = name, undone = undone.len(), "rolled back to savepoint");
        Ok(undone.len())
    }

    /// Forgets a savepoint and every savepoint taken after it.
    pub fn release_savepoint(&self, txn_id: TxnId, name: &str) -> TxnResult<()> {
        let slot = self.slot(txn_id, "release savepoint in")?;
        let mut body = slot.body.lock();
        self.ensure_open(&slot, "release savepoint in")?;

        let index = find_savepoint(&body, txn_id, name)?;
        body.savepoints.truncate(index);
        Ok(())
    }

    /// Commits a transaction and returns the LSN of its commit record.
    ///
    /// Read-only transactions write nothing and return [`Lsn::INVALID`].
    /// On a serialization failure or a WAL failure the transaction is
    /// aborted and the error returned.
    pub fn commit(&self, txn_id: TxnId) -> TxnResult<Lsn> {
        let slot = self.slot(txn_id, "commit")?;
        let mut body = slot.body.lock();
        slot.transition(
            &[TransactionState::Active, TransactionState::IdleInTransaction],
            TransactionState::Committing,
        )
        .map_err(|state| self.unusable(&slot, state, "commit"))?;

        let write_keys: HashSet<RowKey> = body.writes.iter().map(|w| w.key).collect();
        if let Err(err) = self.snapshots.begin_commit(txn_id, write_keys) {
            self.stats
                .serialization_failures
                .fetch_add(1, AtomicOrdering::Relaxed);
            tracing::debug!(txn = %txn_id, error = %err, "serializable validation failed");
            slot.set_state(TransactionState::Aborting);
            self.finish_abort(&slot, &mut body);
            return Err(err.into());
        }

        if body.writes.is_empty() {
            self.snapshots.finish(txn_id);
            self.locks.release_all(txn_id);
            self.complete(&slot, TransactionState::Committed, None);
            return Ok(Lsn::INVALID);
        }

        // The real commit timestamp is only known once the commit is
        // published; the record carries a lower bound.
        let hint = self.clock.read().next();
        let logged = self
            .log
            .append(
                txn_id,
                WalPayload::Commit(CommitPayload {
                    commit_timestamp: hint,
                }),
            )
            .and_then(|lsn| self.log.flush(lsn).map(|()| lsn));
        let lsn = match logged {
            Ok(lsn) => lsn,
            Err(err) => {
                self.stats.wal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                tracing::error!(txn = %txn_id, error = %err, "commit record not durable, aborting");
                self.snapshots.abandon_commit(txn_id);
                slot.set_state(TransactionState::Aborting);
                self.finish_abort(&slot, &mut body);
                return Err(TxnError::WalWriteFailure(err));
            }
        };

        body.last_lsn = lsn;
        let writes = std::mem::take(&mut body.writes);
        let commit_ts = self
            .snapshots
            .publish_commit(txn_id, |ts| self.store.commit(&writes, ts));
        self.locks.release_all(txn_id);
        self.complete(&slot, TransactionState::Committed, Some(commit_ts));

        tracing::debug!(txn = %txn_id, %lsn, %commit_ts, writes = writes.len(), "transaction committed");
        Ok(lsn)
    }

    /// Aborts a transaction. Aborting an unknown or already finished
    /// transaction succeeds.
    pub fn abort(&self, txn_id: TxnId) -> TxnResult<()> {
        match self.rollback(txn_id, RollbackCause::User) {
            RollbackOutcome::AlreadyCommitted => Err(TxnError::InvalidState {
                txn_id,
                state: TransactionState::Committed,
                operation: "abort",
            }),
            RollbackOutcome::CommitInProgress => Err(TxnError::InvalidState {
                txn_id,
                state: TransactionState::Committing,
                operation: "abort",
            }),
            _ => Ok(()),
        }
    }

    /// Rolls back a deadlock victim. A blocked lock request of the victim
    /// returns [`TxnError::DeadlockVictim`], as does every later call.
    pub fn rollback_victim(&self, txn_id: TxnId) -> bool {
        self.rollback(txn_id, RollbackCause::DeadlockVictim) == RollbackOutcome::RolledBack
    }

    pub(crate) fn rollback(&self, txn_id: TxnId, cause: RollbackCause) -> RollbackOutcome {
        let Some(slot) = self.live.read().get(&txn_id).cloned() else {
            return match self.finished_record(txn_id) {
                Some(f) if f.state == TransactionState::Committed => {
                    RollbackOutcome::AlreadyCommitted
                }
                Some(_) => RollbackOutcome::AlreadyAborted,
                None => RollbackOutcome::NotFound,
            };
        };

        match slot.transition(
            &[TransactionState::Active, TransactionState::IdleInTransaction],
            TransactionState::Aborting,
        ) {
            Ok(()) => {}
            Err(TransactionState::Committing) => return RollbackOutcome::CommitInProgress,
            Err(TransactionState::Committed) => return RollbackOutcome::AlreadyCommitted,
            Err(_) => return RollbackOutcome::AlreadyAborted,
        }

        let reason = match cause {
            RollbackCause::DeadlockVictim => {
                slot.victim.store(true, AtomicOrdering::Release);
                self.stats.deadlock_victims.fetch_add(1, AtomicOrdering::Relaxed);
                CancelReason::DeadlockVictim
            }
            RollbackCause::Admin => {
                self.stats.admin_rollbacks.fetch_add(1, AtomicOrdering::Relaxed);
                CancelReason::Aborted
            }
            RollbackCause::User => CancelReason::Aborted,
        };
        // Wake the owner if it is blocked so it releases nothing we need.
        self.locks.cancel_wait(txn_id, reason);

        let mut body = slot.body.lock();
        self.finish_abort(&slot, &mut body);
        RollbackOutcome::RolledBack
    }

    /// Aborts an open transaction whose log record could not be written.
    /// If a concurrent rollback already claimed it, that rollback finishes
    /// the job once `body` is released.
    fn abort_after_wal_failure(&self, slot: &TxnSlot, body: &mut TxnBody) {
        let claimed = slot.transition(
            &[TransactionState::Active, TransactionState::IdleInTransaction],
            TransactionState::Aborting,
        );
        if claimed.is_ok() {
            self.finish_abort(slot, body);
        }
    }

    /// Undoes everything and ends the transaction. The state must already
    /// be `Aborting`.
    fn finish_abort(&self, slot: &TxnSlot, body: &mut TxnBody) {
        let writes = std::mem::take(&mut body.writes);
        self.store.rollback(&writes);
        self.locks.release_all(slot.id);
        self.snapshots.finish(slot.id);
        body.savepoints.clear();

        if body.last_lsn.is_valid() {
            match self.log.append(slot.id, WalPayload::Abort) {
                Ok(lsn) => body.last_lsn = lsn,
                Err(err) => {
                    tracing::warn!(txn = %slot.id, error = %err, "abort record not written");
                }
            }
        }

        self.complete(slot, TransactionState::Aborted, None);
        tracing::debug!(txn = %slot.id, undone = writes.len(), "transaction aborted");
    }

    /// Moves a transaction to its terminal state and out of the live table.
    fn complete(&self, slot: &TxnSlot, state: TransactionState, commit_ts: Option<Timestamp>) {
        slot.set_state(state);
        self.live.write().remove(&slot.id);

        match state {
            TransactionState::Committed => self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed),
            _ => self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed),
        };

        let record = FinishedTransaction {
            txn_id: slot.id,
            state,
            isolation: slot.isolation(),
            started_at: slot.started_wall,
            finished_at: WallTime::now(),
            duration_ms: slot.started_at.elapsed().as_millis() as u64,
            statements: slot.statements.load(AtomicOrdering::Relaxed),
            rows_affected: slot.rows_affected.load(AtomicOrdering::Relaxed),
            deadlock_victim: slot.is_victim(),
            commit_ts,
        };
        let mut finished = self.finished.lock();
        while finished.len() >= self.config.finished_history.max(1) {
            finished.pop_front();
        }
        finished.push_back(record);
    }

    /// Aborts every live transaction, stops the detector and closes the
    /// log.
    pub fn shutdown(&self) -> TxnResult<()> {
        if let Some(handle) = self.detector_handle.lock().take() {
            handle.stop();
        }

        let live: Vec<TxnId> = self.live.read().keys().copied().collect();
        for txn_id in &live {
            self.rollback(*txn_id, RollbackCause::User);
        }
        self.log.close().map_err(TxnError::WalWriteFailure)?;
        tracing::info!(aborted = live.len(), "transaction manager shut down");
        Ok(())
    }

    /// Returns the state of a live or recently finished transaction.
    pub fn state(&self, txn_id: TxnId) -> Option<TransactionState> {
        if let Some(slot) = self.live.read().get(&txn_id) {
            return Some(slot.state());
        }
        self.finished_record(txn_id).map(|f| f.state)
    }

    /// Returns the number of live transactions.
    pub fn active_count(&self) -> usize {
        self.live.read().len()
    }

    /// Returns the lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Returns the version store.
    pub fn version_store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    /// Returns the snapshot manager.
    pub fn snapshot_manager(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Returns the deadlock detector.
    pub fn deadlock_detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransactionManagerConfig {
        &self.config
    }

    /// Returns statistics.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub(crate) fn slot(&self, txn_id: TxnId, operation: &'static str) -> TxnResult<Arc<TxnSlot>> {
        if let Some(slot) = self.live.read().get(&txn_id) {
            return Ok(Arc::clone(slot));
        }
        Err(self.ended_error(txn_id, operation))
    }

    pub(crate) fn finished_record(&self, txn_id: TxnId) -> Option<FinishedTransaction> {
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|f| f.txn_id == txn_id)
            .cloned()
    }

    fn ended_error(&self, txn_id: TxnId, operation: &'static str) -> TxnError {
        match self.finished_record(txn_id) {
            Some(f) if f.deadlock_victim => TxnError::DeadlockVictim(txn_id),
            Some(f) if f.state == TransactionState::Aborted => TxnError::Aborted(txn_id),
            Some(f) => TxnError::InvalidState {
                txn_id,
                state: f.state,
                operation,
            },
            None => TxnError::NotFound(txn_id),
        }
    }

    fn unusable(&self, slot: &TxnSlot, state: TransactionState, operation: &'static str) -> TxnError {
        if slot.is_victim() {
            return TxnError::DeadlockVictim(slot.id);
        }
        match state {
            TransactionState::Aborting | TransactionState::Aborted => TxnError::Aborted(slot.id),
            state => TxnError::InvalidState {
                txn_id: slot.id,
                state,
                operation,
            },
        }
    }

    fn ensure_open(&self, slot: &TxnSlot, operation: &'static str) -> TxnResult<()> {
        match slot.state() {
            state if state.is_open() => Ok(()),
            state => Err(self.unusable(slot, state, operation)),
        }
    }

    /// Implicitly begins a statement if the transaction is idle.
    fn enter_statement(&self, slot: &TxnSlot, operation: &'static str) -> TxnResult<()> {
        slot.pin();
        match slot.transition(
            &[TransactionState::IdleInTransaction],
            TransactionState::Active,
        ) {
            Ok(()) => self.start_statement(slot),
            Err(TransactionState::Active) => Ok(()),
            Err(state) => Err(self.unusable(slot, state, operation)),
        }
    }

    fn start_statement(&self, slot: &TxnSlot) -> TxnResult<()> {
        slot.pin();
        slot.statements.fetch_add(1, AtomicOrdering::Relaxed);
        if slot.isolation().snapshot_per_statement() {
            self.snapshots
                .take_snapshot(slot.id)
                .map_err(|_| self.ended_error(slot.id, "begin statement in"))?;
        }
        Ok(())
    }
}

fn lock_error(slot: &TxnSlot, err: LockError) -> TxnError {
    match err {
        LockError::Timeout {
            txn_id,
            resource,
            waited,
            ..
        } => TxnError::LockTimeout {
            txn_id,
            resource,
            waited,
        },
        LockError::DeadlockVictim { txn_id } => TxnError::DeadlockVictim(txn_id),
        LockError::Cancelled { txn_id, .. } if slot.is_victim() => TxnError::DeadlockVictim(txn_id),
        LockError::Cancelled { txn_id, .. } => TxnError::Aborted(txn_id),
    }
}

fn find_savepoint(body: &TxnBody, txn_id: TxnId, name: &str) -> TxnResult<usize> {
    body.savepoints
        .iter()
        .rposition(|s| s.name == name)
        .ok_or_else(|| TxnError::SavepointNotFound {
            txn_id,
            name: name.to_string(),
        })
}

impl VictimHandler for TransactionManager {
    fn started_at(&self, txn_id: TxnId) -> Option<Instant> {
        self.live.read().get(&txn_id).map(|slot| slot.started_at)
    }

    fn rollback_victim(&self, txn_id: TxnId) -> bool {
        TransactionManager::rollback_victim(self, txn_id)
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active_count())
            .field("next_txn_id", &self.next_txn_id.load(AtomicOrdering::Relaxed))
            .field("clock", &self.clock.read())
            .field("config", &self.config)
            .finish()
    }
}
