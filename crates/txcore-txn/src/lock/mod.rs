//! Lock management for transaction isolation.
//!
//! This module implements a hierarchical lock manager supporting:
//! - Row and table locks in IS, IX, S, SIX and X modes
//! - Lock conversion (e.g. S to X), granted in place when possible
//! - FIFO wait queues where conversions go ahead of new requests
//! - Blocking acquisition with timeout and external cancellation
//! - Escalation of many row locks on one table to a single table lock
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ IS │ IX │ S  │ SIX │ X  │
//! ─────────┼────┼────┼────┼─────┼────┤
//!     IS   │ ✓  │ ✓  │ ✓  │  ✓  │ ✗  │
//!     IX   │ ✓  │ ✓  │ ✗  │  ✗  │ ✗  │
//!     S    │ ✓  │ ✗  │ ✓  │  ✗  │ ✗  │
//!     SIX  │ ✓  │ ✗  │ ✗  │  ✗  │ ✗  │
//!     X    │ ✗  │ ✗  │ ✗  │  ✗  │ ✗  │
//! ```
//!
//! # Sharding
//!
//! The lock table is split into a power-of-two number of shards selected by
//! resource hash. Each shard has its own mutex and condition variable, so
//! waiters only contend with requests hashing to the same shard.
//!
//! # Lock Ordering
//!
//! Internal locks are always taken shard first, then the transaction
//! registry, then the wait index.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

use txcore_common::config::LockConfig;
use txcore_common::types::{RowKey, TableId, TxnId};

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LockMode {
    /// Intention shared (table-level hint for row S locks).
    IntentionShared,
    /// Intention exclusive (table-level hint for row X locks).
    IntentionExclusive,
    /// Shared lock (read lock).
    Shared,
    /// Shared plus intention exclusive.
    SharedIntentionExclusive,
    /// Exclusive lock (write lock).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Returns true if holding `self` already grants everything `other`
    /// grants.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (a, b) if a == b => true,
            (Exclusive, _) => true,
            (SharedIntentionExclusive, IntentionShared | IntentionExclusive | Shared) => true,
            (Shared | IntentionExclusive, IntentionShared) => true,
            _ => false,
        }
    }

    /// Returns the weakest mode covering both.
    pub fn stronger(self, other: LockMode) -> LockMode {
        use LockMode::*;
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            match (self, other) {
                (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => {
                    SharedIntentionExclusive
                }
                _ => Exclusive,
            }
        }
    }

    /// Returns the conventional short name.
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceId {
    /// A table-level lock.
    Table(TableId),
    /// A row-level lock.
    Row(RowKey),
}

impl ResourceId {
    /// Creates a table resource ID.
    pub fn table(table_id: TableId) -> Self {
        ResourceId::Table(table_id)
    }

    /// Creates a row resource ID.
    pub fn row(key: RowKey) -> Self {
        ResourceId::Row(key)
    }

    /// Returns the table ID for this resource.
    pub fn table_id(&self) -> TableId {
        match self {
            ResourceId::Table(id) => *id,
            ResourceId::Row(key) => key.table,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Table(id) => write!(f, "table({})", id),
            ResourceId::Row(key) => write!(f, "row({})", key),
        }
    }
}

/// Why a lock wait was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The transaction was chosen to break a deadlock.
    DeadlockVictim,
    /// The transaction was aborted.
    Aborted,
    /// The transaction is not registered (never began or already ended).
    NotRegistered,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlockVictim => f.write_str("deadlock victim"),
            CancelReason::Aborted => f.write_str("transaction aborted"),
            CancelReason::NotRegistered => f.write_str("transaction not registered"),
        }
    }
}

/// Errors returned by [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The request was not granted within its timeout.
    #[error("transaction {txn_id} timed out after {waited:?} waiting for {mode} on {resource}")]
    Timeout {
        /// Waiting transaction.
        txn_id: TxnId,
        /// Requested resource.
        resource: ResourceId,
        /// Requested mode.
        mode: LockMode,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The transaction was chosen as deadlock victim while waiting.
    #[error("transaction {txn_id} was chosen as deadlock victim")]
    DeadlockVictim {
        /// Victim transaction.
        txn_id: TxnId,
    },

    /// The wait was cancelled or the transaction may not take locks.
    #[error("lock request of transaction {txn_id} cancelled: {reason}")]
    Cancelled {
        /// Requesting transaction.
        txn_id: TxnId,
        /// Cancellation cause.
        reason: CancelReason,
    },
}

/// Result type for lock operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// How a successful acquisition was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// Lock was granted.
    Granted,
    /// An existing lock was converted to a stronger mode.
    Upgraded,
    /// Transaction already held a covering mode.
    AlreadyHeld,
}

/// Notifications consumed by the deadlock detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitEvent {
    /// A transaction started waiting.
    Blocked {
        /// Waiting transaction.
        txn_id: TxnId,
        /// Resource waited on.
        resource: ResourceId,
    },
    /// A transaction stopped waiting (granted, timed out or cancelled).
    Resumed {
        /// Transaction that stopped waiting.
        txn_id: TxnId,
    },
}

/// A wait-for edge: `waiter` cannot proceed until `holder` releases or
/// dequeues its request on `resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WaitEdge {
    /// Blocked transaction.
    pub waiter: TxnId,
    /// Transaction it waits for.
    pub holder: TxnId,
    /// Contended resource.
    pub resource: ResourceId,
}

/// Row locks replaced by one table lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Escalation {
    /// Table now locked as a whole.
    pub table: TableId,
    /// Mode held on the table afterwards.
    pub mode: LockMode,
    /// Row locks released.
    pub rows_released: usize,
}

/// A granted lock in the lock tree.
#[derive(Debug, Clone, Serialize)]
pub struct LockHolderInfo {
    /// Holding transaction.
    pub txn_id: TxnId,
    /// Granted mode.
    pub mode: LockMode,
}

/// A queued request in the lock tree.
#[derive(Debug, Clone, Serialize)]
pub struct LockWaiterInfo {
    /// Waiting transaction.
    pub txn_id: TxnId,
    /// Requested mode.
    pub mode: LockMode,
    /// True for a conversion of an already held lock.
    pub upgrade: bool,
    /// Time spent waiting so far, in milliseconds.
    pub waited_ms: u64,
    /// Transactions this request waits for.
    pub blocked_by: Vec<TxnId>,
}

/// One resource of the lock tree.
#[derive(Debug, Clone, Serialize)]
pub struct LockTreeNode {
    /// The resource.
    pub resource: ResourceId,
    /// Current holders.
    pub holders: Vec<LockHolderInfo>,
    /// Queued requests in grant order.
    pub waiters: Vec<LockWaiterInfo>,
}

/// What a transaction is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitingOn {
    /// Resource waited on.
    pub resource: ResourceId,
    /// Requested mode.
    pub mode: LockMode,
    /// Time spent waiting so far, in milliseconds.
    pub waited_ms: u64,
}

/// Statistics about the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions (immediate or after a wait).
    pub acquisitions: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Requests that had to wait.
    pub waits: AtomicU64,
    /// Waits ended by deadlock resolution.
    pub deadlock_victims: AtomicU64,
    /// Waits cancelled by abort.
    pub cancellations: AtomicU64,
    /// Lock conversions.
    pub upgrades: AtomicU64,
    /// Waits that timed out.
    pub timeouts: AtomicU64,
    /// Row lock sets replaced by a table lock.
    pub escalations: AtomicU64,
}

impl LockStats {
    /// Returns a serializable copy.
    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            acquisitions: self.acquisitions.load(AtomicOrdering::Relaxed),
            releases: self.releases.load(AtomicOrdering::Relaxed),
            waits: self.waits.load(AtomicOrdering::Relaxed),
            deadlock_victims: self.deadlock_victims.load(AtomicOrdering::Relaxed),
            cancellations: self.cancellations.load(AtomicOrdering::Relaxed),
            upgrades: self.upgrades.load(AtomicOrdering::Relaxed),
            timeouts: self.timeouts.load(AtomicOrdering::Relaxed),
            escalations: self.escalations.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LockStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStatsSnapshot {
    /// Total lock acquisitions.
    pub acquisitions: u64,
    /// Total lock releases.
    pub releases: u64,
    /// Requests that had to wait.
    pub waits: u64,
    /// Waits ended by deadlock resolution.
    pub deadlock_victims: u64,
    /// Waits cancelled by abort.
    pub cancellations: u64,
    /// Lock conversions.
    pub upgrades: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Row lock sets replaced by a table lock.
    pub escalations: u64,
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Default lock timeout.
    pub lock_timeout: Duration,
    /// Number of lock table shards (rounded up to a power of two).
    pub shards: usize,
    /// Row locks on one table that trigger escalation; 0 disables it.
    pub escalation_threshold: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockManagerConfig {
    fn from(config: &LockConfig) -> Self {
        Self {
            lock_timeout: config.timeout,
            shards: config.shards,
            escalation_threshold: config.escalation_threshold,
        }
    }
}

impl LockManagerConfig {
    /// Sets the default lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the shard count.
    #[must_use]
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Sets the escalation threshold.
    #[must_use]
    pub fn with_escalation_threshold(mut self, threshold: usize) -> Self {
        self.escalation_threshold = threshold;
        self
    }
}

#[derive(Debug)]
struct Waiter {
    txn_id: TxnId,
    mode: LockMode,
    upgrade: bool,
    since: Instant,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<TxnId, LockMode>,
    queue: VecDeque<Waiter>,
}

impl LockEntry {
    /// Checks `mode` against every holder except `txn_id` itself.
    fn compatible_with_holders(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .all(|(holder, held)| *holder == txn_id || mode.is_compatible_with(*held))
    }

    fn is_free(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    /// Transactions the waiter at `index` waits for: conflicting holders,
    /// conflicting requests queued ahead of it, and the request directly
    /// ahead, since grants leave the queue strictly from the head.
    fn blockers(&self, index: usize) -> Vec<TxnId> {
        let waiter = &self.queue[index];
        let mut out: Vec<TxnId> = self
            .holders
            .iter()
            .filter(|(holder, held)| {
                **holder != waiter.txn_id && !waiter.mode.is_compatible_with(**held)
            })
            .map(|(holder, _)| *holder)
            .collect();
        for ahead in self.queue.iter().take(index) {
            if ahead.txn_id != waiter.txn_id
                && !waiter.mode.is_compatible_with(ahead.mode)
                && !out.contains(&ahead.txn_id)
            {
                out.push(ahead.txn_id);
            }
        }
        if let Some(previous) = index.checked_sub(1).map(|i| self.queue[i].txn_id) {
            if previous != waiter.txn_id && !out.contains(&previous) {
                out.push(previous);
            }
        }
        out.sort();
        out
    }
}

enum WaitOutcome {
    Granted,
    Cancelled(CancelReason),
}

#[derive(Default)]
struct ShardState {
    entries: HashMap<ResourceId, LockEntry>,
    /// Decisions taken for waiters by other threads, picked up on wake.
    outcomes: HashMap<TxnId, WaitOutcome>,
}

#[derive(Default)]
struct Shard {
    state: Mutex<ShardState>,
    wakeup: Condvar,
}

#[derive(Debug, Clone, Copy)]
struct WaitIndexEntry {
    resource: ResourceId,
    mode: LockMode,
    since: Instant,
}

/// The lock manager for managing transaction locks.
pub struct LockManager {
    shards: Box<[Shard]>,
    hasher: RandomState,
    /// Registered transactions and the resources they hold.
    txns: Mutex<HashMap<TxnId, HashSet<ResourceId>>>,
    /// Which resource each blocked transaction waits on.
    waiting: Mutex<HashMap<TxnId, WaitIndexEntry>>,
    events: Mutex<Vec<Sender<WaitEvent>>>,
    config: LockManagerConfig,
    stats: LockStats,
}

impl LockManager {
    /// Creates a new lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Creates a lock manager with custom configuration.
    pub fn with_config(config: LockManagerConfig) -> Self {
        let count = config.shards.max(1).next_power_of_two();
        let shards = (0..count).map(|_| Shard::default()).collect();
        Self {
            shards,
            hasher: RandomState::new(),
            txns: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            config,
            stats: LockStats::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    fn shard(&self, resource: &ResourceId) -> &Shard {
        let hash = self.hasher.hash_one(resource) as usize;
        &self.shards[hash & (self.shards.len() - 1)]
    }

    /// Returns a receiver of wait events. Events are dropped for receivers
    /// that went away.
    pub fn subscribe(&self) -> Receiver<WaitEvent> {
        let (tx, rx) = mpsc::channel();
        self.events.lock().push(tx);
        rx
    }

    fn publish(&self, event: WaitEvent) {
        let mut senders = self.events.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Registers a transaction. Acquisitions by unregistered transactions
    /// fail with [`CancelReason::NotRegistered`].
    pub fn register(&self, txn_id: TxnId) {
        self.txns.lock().entry(txn_id).or_default();
    }

    /// Returns true if the transaction is registered.
    pub fn is_registered(&self, txn_id: TxnId) -> bool {
        self.txns.lock().contains_key(&txn_id)
    }

    /// Acquires `mode` on `resource` for `txn_id`, blocking until granted.
    ///
    /// `timeout` defaults to the configured lock timeout. A row request is
    /// already held when the transaction's table lock covers it. Granting a
    /// row lock may escalate the transaction's row locks on that table.
    pub fn acquire(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> LockResult<LockGrant> {
        if self.covered_by_table(txn_id, resource, mode) {
            return Ok(LockGrant::AlreadyHeld);
        }
        let grant = self.lock_resource(txn_id, resource, mode, timeout)?;
        if let (ResourceId::Row(key), LockGrant::Granted) = (resource, grant) {
            self.escalate_if_needed(txn_id, key.table);
        }
        Ok(grant)
    }

    fn lock_resource(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> LockResult<LockGrant> {
        let timeout = timeout.unwrap_or(self.config.lock_timeout);
        let shard = self.shard(&resource);
        let mut state = shard.state.lock();

        // A stale decision from an earlier wait must not leak into this one.
        state.outcomes.remove(&txn_id);

        let entry = state.entries.entry(resource).or_default();
        let held = entry.holders.get(&txn_id).copied();

        let (target, upgrade) = match held {
            Some(current) if current.covers(mode) => return Ok(LockGrant::AlreadyHeld),
            Some(current) => (current.stronger(mode), true),
            None => (mode, false),
        };

        let grantable = entry.compatible_with_holders(txn_id, target)
            && (upgrade || entry.queue.is_empty());
        if grantable {
            if !self.record_grant(txn_id, resource) {
                if entry.is_free() {
                    state.entries.remove(&resource);
                }
                return Err(LockError::Cancelled {
                    txn_id,
                    reason: CancelReason::NotRegistered,
                });
            }
            entry.holders.insert(txn_id, target);
            self.stats.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
            if upgrade {
                self.stats.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(LockGrant::Upgraded);
            }
            return Ok(LockGrant::Granted);
        }

        // Publish the wait before checking registration so that a
        // concurrent release_all either sees the wait or makes the check
        // fail.
        let since = Instant::now();
        self.waiting.lock().insert(
            txn_id,
            WaitIndexEntry {
                resource,
                mode: target,
                since,
            },
        );
        if !self.is_registered(txn_id) {
            self.waiting.lock().remove(&txn_id);
            if entry.is_free() {
                state.entries.remove(&resource);
            }
            return Err(LockError::Cancelled {
                txn_id,
                reason: CancelReason::NotRegistered,
            });
        }

        // Conversions queue behind other conversions but ahead of every
        // new request.
        let waiter = Waiter {
            txn_id,
            mode: target,
            upgrade,
            since,
        };
        if upgrade {
            let pos = entry.queue.iter().take_while(|w| w.upgrade).count();
            entry.queue.insert(pos, waiter);
        } else {
            entry.queue.push_back(waiter);
        }
        self.stats.waits.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::trace!(txn = %txn_id, %resource, mode = %target, "lock wait");
        self.publish(WaitEvent::Blocked { txn_id, resource });

        let deadline = since + timeout;
        let result = loop {
            if let Some(outcome) = state.outcomes.remove(&txn_id) {
                break match outcome {
                    WaitOutcome::Granted => {
                        if upgrade {
                            self.stats.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
                            Ok(LockGrant::Upgraded)
                        } else {
                            Ok(LockGrant::Granted)
                        }
                    }
                    WaitOutcome::Cancelled(CancelReason::DeadlockVictim) => {
                        Err(LockError::DeadlockVictim { txn_id })
                    }
                    WaitOutcome::Cancelled(reason) => Err(LockError::Cancelled { txn_id, reason }),
                };
            }

            if Instant::now() >= deadline {
                if let Some(entry) = state.entries.get_mut(&resource) {
                    entry.queue.retain(|w| w.txn_id != txn_id);
                }
                let granted = self.regrant(&mut state, resource);
                if granted {
                    shard.wakeup.notify_all();
                }
                self.stats.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
                break Err(LockError::Timeout {
                    txn_id,
                    resource,
                    mode,
                    waited: since.elapsed(),
                });
            }

            shard.wakeup.wait_until(&mut state, deadline);
        };

        self.waiting.lock().remove(&txn_id);
        drop(state);
        self.publish(WaitEvent::Resumed { txn_id });
        result
    }

    /// Tries to acquire without waiting. Returns `None` if the request
    /// would block.
    pub fn try_acquire(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
    ) -> LockResult<Option<LockGrant>> {
        if self.covered_by_table(txn_id, resource, mode) {
            return Ok(Some(LockGrant::AlreadyHeld));
        }
        {
            let state = self.shard(&resource).state.lock();
            if let Some(entry) = state.entries.get(&resource) {
                let target = match entry.holders.get(&txn_id) {
                    Some(held) if held.covers(mode) => return Ok(Some(LockGrant::AlreadyHeld)),
                    Some(held) => held.stronger(mode),
                    None => mode,
                };
                let upgrade = entry.holders.contains_key(&txn_id);
                if !entry.compatible_with_holders(txn_id, target)
                    || (!upgrade && !entry.queue.is_empty())
                {
                    return Ok(None);
                }
            }
        }
        // Grantable a moment ago; a zero timeout turns a lost race into a
        // timeout instead of a wait.
        match self.acquire(txn_id, resource, mode, Some(Duration::ZERO)) {
            Ok(grant) => Ok(Some(grant)),
            Err(LockError::Timeout { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn held_mode(&self, txn_id: TxnId, resource: ResourceId) -> Option<LockMode> {
        let state = self.shard(&resource).state.lock();
        state
            .entries
            .get(&resource)
            .and_then(|e| e.holders.get(&txn_id))
            .copied()
    }

    /// Returns true if the transaction holds `mode` on `resource`, either
    /// directly or through a covering table lock.
    pub fn holds(&self, txn_id: TxnId, resource: ResourceId, mode: LockMode) -> bool {
        self.covered_by_table(txn_id, resource, mode)
            || self
                .held_mode(txn_id, resource)
                .is_some_and(|held| held.covers(mode))
    }

    fn covered_by_table(&self, txn_id: TxnId, resource: ResourceId, mode: LockMode) -> bool {
        match resource {
            ResourceId::Row(key) => self
                .held_mode(txn_id, ResourceId::table(key.table))
                .is_some_and(|held| held.covers(mode)),
            ResourceId::Table(_) => false,
        }
    }

    fn escalate_if_needed(&self, txn_id: TxnId, table: TableId) {
        let threshold = self.config.escalation_threshold;
        if threshold == 0 {
            return;
        }
        let rows = self.txns.lock().get(&txn_id).map_or(0, |held| {
            held.iter()
                .filter(|r| matches!(r, ResourceId::Row(key) if key.table == table))
                .count()
        });
        if rows < threshold {
            return;
        }
        if let Err(err) = self.escalate(txn_id, table) {
            tracing::debug!(txn = %txn_id, %table, error = %err, "lock escalation failed");
        }
    }

    /// Replaces the transaction's row locks on `table` with one table lock.
    ///
    /// The table lock is S when every row lock is shared and X otherwise,
    /// combined with whatever the transaction already holds on the table.
    /// It is taken only if that needs no wait; `None` means nothing changed.
    pub fn escalate(&self, txn_id: TxnId, table: TableId) -> LockResult<Option<Escalation>> {
        let rows: Vec<(ResourceId, LockMode)> = self
            .locks_held(txn_id)
            .into_iter()
            .filter(|(r, _)| matches!(r, ResourceId::Row(key) if key.table == table))
            .collect();
        if rows.is_empty() {
            return Ok(None);
        }

        let mode = if rows.iter().all(|(_, m)| LockMode::Shared.covers(*m)) {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let resource = ResourceId::table(table);
        if self.try_acquire(txn_id, resource, mode)?.is_none() {
            tracing::debug!(txn = %txn_id, %table, %mode, "lock escalation would block");
            return Ok(None);
        }

        for (row, _) in &rows {
            self.release(txn_id, *row);
        }
        self.stats.escalations.fetch_add(1, AtomicOrdering::Relaxed);
        let escalation = Escalation {
            table,
            mode: self.held_mode(txn_id, resource).unwrap_or(mode),
            rows_released: rows.len(),
        };
        tracing::info!(
            txn = %txn_id,
            %table,
            mode = %escalation.mode,
            rows = escalation.rows_released,
            "escalated row locks to table lock"
        );
        Ok(Some(escalation))
    }

    /// Adds `resource` to the transaction's held set. Fails if the
    /// transaction is not registered. Called with the shard locked.
    fn record_grant(&self, txn_id: TxnId, resource: ResourceId) -> bool {
        match self.txns.lock().get_mut(&txn_id) {
            Some(held) => {
                held.insert(resource);
                true
            }
            None => false,
        }
    }

    /// Grants queued requests from the head while they are compatible.
    /// Returns true if any waiter was decided.
    fn regrant(&self, state: &mut ShardState, resource: ResourceId) -> bool {
        let ShardState { entries, outcomes } = state;
        let Some(entry) = entries.get_mut(&resource) else {
            return false;
        };

        let mut decided = false;
        while let Some(front) = entry.queue.front() {
            if !entry.compatible_with_holders(front.txn_id, front.mode) {
                break;
            }
            let Some(waiter) = entry.queue.pop_front() else {
                break;
            };
            decided = true;
            if self.record_grant(waiter.txn_id, resource) {
                entry.holders.insert(waiter.txn_id, waiter.mode);
                self.stats.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
                outcomes.insert(waiter.txn_id, WaitOutcome::Granted);
            } else {
                outcomes.insert(
                    waiter.txn_id,
                    WaitOutcome::Cancelled(CancelReason::Aborted),
                );
            }
        }

        if entry.is_free() {
            entries.remove(&resource);
        }
        decided
    }

    /// Releases one lock. Returns false if the transaction did not hold it.
    pub fn release(&self, txn_id: TxnId, resource: ResourceId) -> bool {
        if let Some(held) = self.txns.lock().get_mut(&txn_id) {
            held.remove(&resource);
        }
        self.release_in_shard(txn_id, resource)
    }

    fn release_in_shard(&self, txn_id: TxnId, resource: ResourceId) -> bool {
        let shard = self.shard(&resource);
        let mut state = shard.state.lock();
        let released = match state.entries.get_mut(&resource) {
            Some(entry) => entry.holders.remove(&txn_id).is_some(),
            None => false,
        };
        if released {
            self.stats.releases.fetch_add(1, AtomicOrdering::Relaxed);
            if self.regrant(&mut state, resource) {
                shard.wakeup.notify_all();
            }
        }
        released
    }

    /// Releases every lock of a transaction and unregisters it. A pending
    /// wait of the transaction is cancelled. Returns the number of locks
    /// released.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let held = self.txns.lock().remove(&txn_id).unwrap_or_default();
        self.cancel_wait(txn_id, CancelReason::Aborted);

        let mut count = 0;
        for resource in held {
            if self.release_in_shard(txn_id, resource) {
                count += 1;
            }
        }
        count
    }

    /// Cancels the pending wait of `txn_id`, if any. The waiter returns
    /// [`LockError::DeadlockVictim`] or [`LockError::Cancelled`].
    ///
    /// Returns true if a waiting request was cancelled.
    pub fn cancel_wait(&self, txn_id: TxnId, reason: CancelReason) -> bool {
        let Some(wait) = self.waiting.lock().get(&txn_id).copied() else {
            return false;
        };

        let shard = self.shard(&wait.resource);
        let mut state = shard.state.lock();
        let removed = match state.entries.get_mut(&wait.resource) {
            Some(entry) => {
                let before = entry.queue.len();
                entry.queue.retain(|w| w.txn_id != txn_id);
                entry.queue.len() != before
            }
            None => false,
        };
        if !removed {
            return false;
        }

        state.outcomes.insert(txn_id, WaitOutcome::Cancelled(reason));
        self.regrant(&mut state, wait.resource);
        shard.wakeup.notify_all();

        match reason {
            CancelReason::DeadlockVictim => {
                self.stats.deadlock_victims.fetch_add(1, AtomicOrdering::Relaxed)
            }
            _ => self.stats.cancellations.fetch_add(1, AtomicOrdering::Relaxed),
        };
        tracing::debug!(txn = %txn_id, resource = %wait.resource, %reason, "lock wait cancelled");
        true
    }

    /// Returns every wait-for edge currently present.
    pub fn wait_for_edges(&self) -> Vec<WaitEdge> {
        let mut edges = Vec::new();
        for shard in self.shards.iter() {
            let state = shard.state.lock();
            for (resource, entry) in &state.entries {
                for (index, waiter) in entry.queue.iter().enumerate() {
                    for holder in entry.blockers(index) {
                        edges.push(WaitEdge {
                            waiter: waiter.txn_id,
                            holder,
                            resource: *resource,
                        });
                    }
                }
            }
        }
        edges.sort_by_key(|e| (e.waiter, e.holder));
        edges
    }

    /// Returns every locked or contended resource with holders and waiters.
    pub fn lock_tree(&self) -> Vec<LockTreeNode> {
        let mut nodes = Vec::new();
        for shard in self.shards.iter() {
            let state = shard.state.lock();
            for (resource, entry) in &state.entries {
                let mut holders: Vec<LockHolderInfo> = entry
                    .holders
                    .iter()
                    .map(|(txn_id, mode)| LockHolderInfo {
                        txn_id: *txn_id,
                        mode: *mode,
                    })
                    .collect();
                holders.sort_by_key(|h| h.txn_id);
                let waiters = entry
                    .queue
                    .iter()
                    .enumerate()
                    .map(|(index, w)| LockWaiterInfo {
                        txn_id: w.txn_id,
                        mode: w.mode,
                        upgrade: w.upgrade,
                        waited_ms: w.since.elapsed().as_millis() as u64,
                        blocked_by: entry.blockers(index),
                    })
                    .collect();
                nodes.push(LockTreeNode {
                    resource: *resource,
                    holders,
                    waiters,
                });
            }
        }
        nodes.sort_by_key(|n| n.resource);
        nodes
    }

    /// Returns the locks held by a transaction with their modes.
    pub fn locks_held(&self, txn_id: TxnId) -> Vec<(ResourceId, LockMode)> {
        let resources: Vec<ResourceId> = self
            .txns
            .lock()
            .get(&txn_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let mut out: Vec<(ResourceId, LockMode)> = resources
            .into_iter()
            .filter_map(|resource| {
                let state = self.shard(&resource).state.lock();
                state
                    .entries
                    .get(&resource)
                    .and_then(|e| e.holders.get(&txn_id))
                    .map(|mode| (resource, *mode))
            })
            .collect();
        out.sort();
        out
    }

    /// Returns the number of locks held by a transaction.
    pub fn lock_count_of(&self, txn_id: TxnId) -> usize {
        self.txns.lock().get(&txn_id).map_or(0, HashSet::len)
    }

    /// Returns what a transaction is waiting for, if it is blocked.
    pub fn waiting_on(&self, txn_id: TxnId) -> Option<WaitingOn> {
        self.waiting.lock().get(&txn_id).map(|w| WaitingOn {
            resource: w.resource,
            mode: w.mode,
            waited_ms: w.since.elapsed().as_millis() as u64,
        })
    }

    /// Returns the number of locked or contended resources.
    pub fn lock_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.state.lock().entries.len())
            .sum()
    }

    /// Returns the number of blocked transactions.
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Returns the number of registered transactions.
    pub fn txn_count(&self) -> usize {
        self.txns.lock().len()
    }

    /// Returns statistics about the lock manager.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("shards", &self.shards.len())
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}
