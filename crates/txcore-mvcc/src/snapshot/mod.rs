//! Snapshot management for MVCC reads.
//!
//! A snapshot is the read view of a transaction: the logical timestamp at
//! which it was taken plus the set of transactions that were still running.
//!
//! # Visibility
//!
//! A version is visible to snapshot `S` iff
//! - it was created by `S`'s own transaction and not deleted by it, or
//! - its creator committed at `begin_ts <= S.ts` and was not in `S`'s active
//!   set, and it is not deleted by a transaction that committed at
//!   `end_ts <= S.ts` outside the active set.
//!
//! # Commit ordering
//!
//! [`SnapshotManager::publish_commit`] allocates the commit timestamp, stamps
//! the versions, and removes the transaction from the active set while
//! holding the registry lock that [`SnapshotManager::take_snapshot`] also
//! takes. A snapshot therefore observes every commit that finished before
//! it and none that finishes after it.
//!
//! # Serializable validation
//!
//! Serializable transactions record the keys they read. At commit the
//! transaction's read and write keys are checked against the write sets of
//! transactions that committed after its snapshot, and against transactions
//! that passed validation but have not published yet (first committer wins).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use txcore_common::types::{IsolationLevel, RowKey, Timestamp, TxnId, WallTime};

use crate::clock::LogicalClock;
use crate::error::{MvccError, MvccResult};
use crate::version::Version;

/// A snapshot representing a consistent view of the database.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Transaction that owns this snapshot.
    txn_id: TxnId,
    /// Logical timestamp of the view.
    ts: Timestamp,
    /// Transactions that were active when this snapshot was taken.
    active: HashSet<TxnId>,
    /// Isolation level of the owner.
    isolation: IsolationLevel,
    /// Wall-clock creation time.
    created_at: WallTime,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        txn_id: TxnId,
        ts: Timestamp,
        active: HashSet<TxnId>,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            txn_id,
            ts,
            active,
            isolation,
            created_at: WallTime::now(),
        }
    }

    /// Creates a snapshot for a specific timestamp with no owner.
    pub fn at_timestamp(ts: Timestamp) -> Self {
        Self::new(
            TxnId::INVALID,
            ts,
            HashSet::new(),
            IsolationLevel::RepeatableRead,
        )
    }

    /// Returns the owning transaction.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Returns the logical timestamp.
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Returns the isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Returns the transactions that were running at creation.
    pub fn active(&self) -> &HashSet<TxnId> {
        &self.active
    }

    /// Returns the wall-clock creation time.
    pub fn created_at(&self) -> WallTime {
        self.created_at
    }

    /// Checks if a version is visible in this snapshot.
    pub fn is_visible(&self, version: &Version) -> bool {
        // Own writes are visible unless deleted by ourselves.
        if version.created_by == self.txn_id {
            return version.deleted_by != Some(self.txn_id);
        }

        let Some(begin) = version.begin_ts else {
            return false;
        };
        if begin > self.ts || self.active.contains(&version.created_by) {
            return false;
        }

        match (version.deleted_by, version.end_ts) {
            (None, _) => true,
            (Some(deleter), _) if deleter == self.txn_id => false,
            (Some(deleter), Some(end)) => end > self.ts || self.active.contains(&deleter),
            (Some(_), None) => true,
        }
    }

    /// Checks if a transaction's commits can be visible in this snapshot.
    pub fn can_see_txn(&self, txn_id: TxnId) -> bool {
        txn_id == self.txn_id || !self.active.contains(&txn_id)
    }
}

/// Live snapshot summary for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Logical timestamp.
    pub ts: Timestamp,
    /// Owner's isolation level.
    pub isolation: IsolationLevel,
    /// Number of transactions in the active set.
    pub active_count: usize,
    /// Smallest id in the active set (the view's xmin).
    pub xmin: Option<TxnId>,
    /// Largest id in the active set.
    pub xmax: Option<TxnId>,
    /// Wall-clock creation time.
    pub created_at: WallTime,
}

impl From<&Snapshot> for SnapshotInfo {
    fn from(s: &Snapshot) -> Self {
        Self {
            txn_id: s.txn_id,
            ts: s.ts,
            isolation: s.isolation,
            active_count: s.active.len(),
            xmin: s.active.iter().min().copied(),
            xmax: s.active.iter().max().copied(),
            created_at: s.created_at,
        }
    }
}

/// Information about an active transaction.
#[derive(Debug)]
struct TransactionEntry {
    isolation: IsolationLevel,
    snapshot: Option<Arc<Snapshot>>,
    read_set: HashSet<RowKey>,
}

/// Write set of a committed transaction, kept for serializable validation.
#[derive(Debug)]
struct CommittedWrites {
    txn_id: TxnId,
    commit_ts: Timestamp,
    keys: HashSet<RowKey>,
}

#[derive(Debug, Default)]
struct Registry {
    active: HashMap<TxnId, TransactionEntry>,
    /// Validated but not yet published write sets.
    reserved: HashMap<TxnId, HashSet<RowKey>>,
    /// Recently committed write sets, oldest first.
    committed: VecDeque<CommittedWrites>,
}

impl Registry {
    fn oldest_serializable_ts(&self) -> Option<Timestamp> {
        self.active
            .values()
            .filter(|e| e.isolation.tracks_reads())
            .filter_map(|e| e.snapshot.as_ref().map(|s| s.ts))
            .min()
    }

    fn prune_committed(&mut self) {
        match self.oldest_serializable_ts() {
            None => self.committed.clear(),
            Some(oldest) => {
                while self
                    .committed
                    .front()
                    .is_some_and(|c| c.commit_ts <= oldest)
                {
                    self.committed.pop_front();
                }
            }
        }
    }
}

/// Manages active transactions and their snapshots.
pub struct SnapshotManager {
    clock: Arc<LogicalClock>,
    registry: RwLock<Registry>,
    /// Highest horizon ever reported, keeps the horizon monotone.
    horizon: AtomicU64,
}

impl SnapshotManager {
    /// Creates a new snapshot manager driven by `clock`.
    pub fn new(clock: Arc<LogicalClock>) -> Self {
        Self {
            clock,
            registry: RwLock::new(Registry::default()),
            horizon: AtomicU64::new(0),
        }
    }

    /// Returns the commit clock.
    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    /// Registers a transaction as active. It has no snapshot until
    /// [`Self::take_snapshot`] is called.
    pub fn register(&self, txn_id: TxnId, isolation: IsolationLevel) {
        self.registry.write().active.insert(
            txn_id,
            TransactionEntry {
                isolation,
                snapshot: None,
                read_set: HashSet::new(),
            },
        );
    }

    /// Takes a fresh snapshot for a registered transaction, replacing its
    /// previous one.
    pub fn take_snapshot(&self, txn_id: TxnId) -> MvccResult<Arc<Snapshot>> {
        let mut registry = self.registry.write();
        self.snapshot_in(&mut registry, txn_id)
    }

    /// Changes the isolation level of a registered transaction. Its read
    /// set is dropped and a fresh snapshot is taken under the new level.
    pub fn set_isolation(
        &self,
        txn_id: TxnId,
        isolation: IsolationLevel,
    ) -> MvccResult<Arc<Snapshot>> {
        let mut registry = self.registry.write();
        let entry = registry
            .active
            .get_mut(&txn_id)
            .ok_or(MvccError::TransactionNotFound(txn_id))?;
        entry.isolation = isolation;
        entry.read_set.clear();
        let snapshot = self.snapshot_in(&mut registry, txn_id)?;
        registry.prune_committed();
        Ok(snapshot)
    }

    fn snapshot_in(&self, registry: &mut Registry, txn_id: TxnId) -> MvccResult<Arc<Snapshot>> {
        let active: HashSet<TxnId> = registry
            .active
            .keys()
            .filter(|id| **id != txn_id)
            .copied()
            .collect();
        let entry = registry
            .active
            .get_mut(&txn_id)
            .ok_or(MvccError::TransactionNotFound(txn_id))?;
        let snapshot = Arc::new(Snapshot::new(
            txn_id,
            self.clock.read(),
            active,
            entry.isolation,
        ));
        entry.snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Returns the current snapshot of a transaction.
    pub fn snapshot_of(&self, txn_id: TxnId) -> Option<Arc<Snapshot>> {
        self.registry
            .read()
            .active
            .get(&txn_id)
            .and_then(|e| e.snapshot.clone())
    }

    /// Records a read for serializable validation. No-op for other levels.
    pub fn record_read(&self, txn_id: TxnId, key: RowKey) {
        let mut registry = self.registry.write();
        if let Some(entry) = registry.active.get_mut(&txn_id) {
            if entry.isolation.tracks_reads() {
                entry.read_set.insert(key);
            }
        }
    }

    /// Validates a committing transaction and reserves its write set.
    ///
    /// Non-serializable transactions always pass. On success the caller must
    /// follow up with [`Self::publish_commit`] or [`Self::abandon_commit`].
    pub fn begin_commit(&self, txn_id: TxnId, write_keys: HashSet<RowKey>) -> MvccResult<()> {
        let mut registry = self.registry.write();
        let entry = registry
            .active
            .get(&txn_id)
            .ok_or(MvccError::TransactionNotFound(txn_id))?;

        if entry.isolation.tracks_reads() {
            let snapshot_ts = entry.snapshot.as_ref().map_or(Timestamp::ZERO, |s| s.ts);
            let touches = |key: &RowKey| entry.read_set.contains(key) || write_keys.contains(key);

            let committed = registry
                .committed
                .iter()
                .filter(|c| c.commit_ts > snapshot_ts)
                .map(|c| (c.txn_id, &c.keys));
            let reserved = registry
                .reserved
                .iter()
                .filter(|(id, _)| **id != txn_id)
                .map(|(id, keys)| (*id, keys));

            for (other, keys) in committed.chain(reserved) {
                if let Some(key) = keys.iter().find(|k| touches(k)) {
                    return Err(MvccError::SerializationFailure {
                        txn_id,
                        conflicting: other,
                        key: *key,
                    });
                }
            }
        }

        registry.reserved.insert(txn_id, write_keys);
        Ok(())
    }

    /// Publishes a validated commit.
    ///
    /// Allocates the commit timestamp and runs `publish` with it, then drops
    /// the transaction from the active set, all while snapshot creation is
    /// excluded.
    pub fn publish_commit<F>(&self, txn_id: TxnId, publish: F) -> Timestamp
    where
        F: FnOnce(Timestamp),
    {
        let mut registry = self.registry.write();
        let commit_ts = self.clock.tick();
        publish(commit_ts);

        registry.active.remove(&txn_id);
        let keys = registry.reserved.remove(&txn_id).unwrap_or_default();
        if !keys.is_empty() {
            registry.committed.push_back(CommittedWrites {
                txn_id,
                commit_ts,
                keys,
            });
        }
        registry.prune_committed();
        commit_ts
    }

    /// Drops the reservation made by [`Self::begin_commit`].
    pub fn abandon_commit(&self, txn_id: TxnId) {
        self.registry.write().reserved.remove(&txn_id);
    }

    /// Removes a transaction that ends without publishing (abort or
    /// read-only commit).
    pub fn finish(&self, txn_id: TxnId) {
        let mut registry = self.registry.write();
        registry.reserved.remove(&txn_id);
        if registry.active.remove(&txn_id).is_some() {
            registry.prune_committed();
        }
    }

    /// Returns the oldest timestamp any live snapshot may read at.
    ///
    /// Versions whose end timestamp is strictly below this value are
    /// invisible to every live and future snapshot. With no live snapshot
    /// the horizon is one past the clock. The value never decreases.
    pub fn oldest_active_snapshot(&self) -> Timestamp {
        let candidate = {
            let registry = self.registry.read();
            registry
                .active
                .values()
                .filter_map(|e| e.snapshot.as_ref().map(|s| s.ts))
                .min()
                .unwrap_or_else(|| self.clock.read().next())
        };
        let prev = self
            .horizon
            .fetch_max(candidate.as_u64(), AtomicOrdering::AcqRel);
        Timestamp::new(prev.max(candidate.as_u64()))
    }

    /// Returns the number of registered transactions.
    pub fn active_count(&self) -> usize {
        self.registry.read().active.len()
    }

    /// Returns the number of live snapshots.
    pub fn active_snapshot_count(&self) -> usize {
        self.registry
            .read()
            .active
            .values()
            .filter(|e| e.snapshot.is_some())
            .count()
    }

    /// Returns the number of committed write sets retained for validation.
    pub fn retained_write_sets(&self) -> usize {
        self.registry.read().committed.len()
    }

    /// Lists live snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        let registry = self.registry.read();
        let mut out: Vec<SnapshotInfo> = registry
            .active
            .values()
            .filter_map(|e| e.snapshot.as_deref().map(SnapshotInfo::from))
            .collect();
        out.sort_by_key(|s| (s.ts, s.txn_id));
        out
    }
}

impl fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("SnapshotManager")
            .field("clock", &self.clock)
            .field("active", &registry.active.len())
            .field("reserved", &registry.reserved.len())
            .field("committed", &registry.committed.len())
            .finish()
    }
}
