//! Deadlock detection using wait-for graph analysis.
//!
//! This module implements deadlock detection for the transaction manager:
//! - Wait-for graph (WFG) rebuilt from the lock manager's live queues
//! - Cycle detection using DFS with recursion-stack marking
//! - Victim selection and resolution through a [`VictimHandler`]
//! - A background thread fed by [`WaitEvent`]s
//!
//! # Wait-For Graph
//!
//! The WFG tracks which transactions are waiting for which:
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 waits for T1:  T3 -> T1 (cycle = deadlock!)
//! ```
//!
//! The graph is never maintained incrementally. Every pass snapshots the
//! edges from the lock table, so a cycle is only reported if it exists in
//! the live lock state at that moment.
//!
//! # Deadlock Resolution
//!
//! The youngest transaction of a cycle (latest begin, ties broken by the
//! larger id) is rolled back. After each resolution the edges are
//! re-snapshotted and the search repeats until no cycle remains.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use txcore_common::config::DeadlockConfig;
use txcore_common::constants::MAX_VICTIMS_PER_PASS;
use txcore_common::types::{TxnId, WallTime};

use crate::lock::{CancelReason, LockManager, WaitEdge, WaitEvent};

/// Upper bound on how long the detector thread sleeps before re-checking
/// its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// The wait-for graph for deadlock detection.
#[derive(Debug, Clone, Default)]
pub struct WaitForGraph {
    /// Edges: waiter -> set of transactions it's waiting for.
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    /// Creates a new empty wait-for graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from lock manager edges.
    pub fn from_edges(edges: &[WaitEdge]) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_wait(edge.waiter, edge.holder);
        }
        graph
    }

    /// Adds a wait-for edge: waiter is waiting for holder.
    pub fn add_wait(&mut self, waiter: TxnId, holder: TxnId) {
        if waiter != holder {
            self.edges.entry(waiter).or_default().insert(holder);
        }
    }

    /// Removes a transaction and every edge touching it.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        self.edges.retain(|_, holders| {
            holders.remove(&txn_id);
            !holders.is_empty()
        });
    }

    /// Returns what a transaction is waiting for.
    pub fn waits_of(&self, waiter: TxnId) -> Vec<TxnId> {
        self.edges
            .get(&waiter)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the number of waiting transactions.
    pub fn waiter_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns the number of wait edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Finds one cycle. The returned transactions are in wait order: each
    /// waits for the next, and the last waits for the first.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut done = HashSet::new();
        let mut path = Vec::new();

        for start in self.edges.keys() {
            if done.contains(start) {
                continue;
            }
            if let Some(cycle) = self.dfs_find_cycle(*start, &mut done, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// DFS keeping the recursion stack in `path`. A node met again while on
    /// the stack closes a cycle.
    fn dfs_find_cycle(
        &self,
        current: TxnId,
        done: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(pos) = path.iter().position(|t| *t == current) {
            return Some(path[pos..].to_vec());
        }
        if done.contains(&current) {
            return None;
        }

        path.push(current);
        if let Some(holders) = self.edges.get(&current) {
            for &holder in holders {
                if let Some(cycle) = self.dfs_find_cycle(holder, done, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(current);
        None
    }

    /// Lists cycles by repeatedly finding one and removing its smallest
    /// member. Every transaction involved in some cycle appears in at least
    /// one returned cycle.
    pub fn cycles(&self) -> Vec<Vec<TxnId>> {
        let mut graph = self.clone();
        let mut out = Vec::new();
        while let Some(cycle) = graph.find_cycle() {
            let Some(min) = cycle.iter().min().copied() else {
                break;
            };
            graph.remove_txn(min);
            out.push(cycle);
        }
        out
    }
}

/// Receives the victims chosen by the detector.
pub trait VictimHandler: Send + Sync {
    /// Returns when the transaction began, if it is still live.
    fn started_at(&self, txn_id: TxnId) -> Option<Instant>;

    /// Rolls back a deadlock victim. Returns false if the transaction was
    /// no longer live.
    fn rollback_victim(&self, txn_id: TxnId) -> bool;
}

/// A resolved deadlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockEvent {
    /// Sequence number of the event.
    pub id: u64,
    /// When the cycle was found.
    pub detected_at: WallTime,
    /// Transactions of the cycle in wait order.
    pub participants: Vec<TxnId>,
    /// Transaction rolled back.
    pub victim: TxnId,
    /// Why the victim was chosen.
    pub reason: String,
}

/// Statistics about deadlock detection.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Number of detection passes performed.
    pub passes: AtomicU64,
    /// Number of cycles found.
    pub cycles_found: AtomicU64,
    /// Number of victims rolled back.
    pub victims: AtomicU64,
}

impl DeadlockStats {
    /// Returns a serializable copy.
    pub fn snapshot(&self) -> DeadlockStatsSnapshot {
        DeadlockStatsSnapshot {
            passes: self.passes.load(AtomicOrdering::Relaxed),
            cycles_found: self.cycles_found.load(AtomicOrdering::Relaxed),
            victims: self.victims.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeadlockStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadlockStatsSnapshot {
    /// Detection passes performed.
    pub passes: u64,
    /// Cycles found.
    pub cycles_found: u64,
    /// Victims rolled back.
    pub victims: u64,
}

/// Configuration for the deadlock detector.
#[derive(Debug, Clone)]
pub struct DeadlockDetectorConfig {
    /// Interval between periodic passes.
    pub check_interval: Duration,
    /// Run an extra pass shortly after a transaction blocks.
    pub detect_on_block: bool,
    /// Delay between a block and the eager pass.
    pub eager_delay: Duration,
    /// Events kept in the history.
    pub history_limit: usize,
}

impl Default for DeadlockDetectorConfig {
    fn default() -> Self {
        Self::from(&DeadlockConfig::default())
    }
}

impl From<&DeadlockConfig> for DeadlockDetectorConfig {
    fn from(config: &DeadlockConfig) -> Self {
        Self {
            check_interval: config.interval,
            detect_on_block: config.detect_on_block,
            eager_delay: config.eager_delay,
            history_limit: config.history_limit,
        }
    }
}

impl DeadlockDetectorConfig {
    /// Sets the check interval.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Enables or disables eager passes after a block.
    #[must_use]
    pub fn with_detect_on_block(mut self, enabled: bool) -> Self {
        self.detect_on_block = enabled;
        self
    }

    /// Sets the history size.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Deadlock detector over a [`LockManager`].
pub struct DeadlockDetector {
    lock_manager: Arc<LockManager>,
    handler: RwLock<Option<Weak<dyn VictimHandler>>>,
    config: DeadlockDetectorConfig,
    history: Mutex<VecDeque<DeadlockEvent>>,
    next_event_id: AtomicU64,
    stats: DeadlockStats,
    /// Serializes passes of the background thread and `detect_now`.
    pass_lock: Mutex<()>,
}

impl DeadlockDetector {
    /// Creates a new deadlock detector.
    pub fn new(lock_manager: Arc<LockManager>, config: DeadlockDetectorConfig) -> Self {
        Self {
            lock_manager,
            handler: RwLock::new(None),
            config,
            history: Mutex::new(VecDeque::new()),
            next_event_id: AtomicU64::new(1),
            stats: DeadlockStats::default(),
            pass_lock: Mutex::new(()),
        }
    }

    /// Installs the component that rolls back victims. Without a handler
    /// the victim's lock wait is only cancelled.
    pub fn set_handler(&self, handler: Weak<dyn VictimHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DeadlockDetectorConfig {
        &self.config
    }

    /// Runs one detection pass synchronously. Returns the deadlocks
    /// resolved by it.
    pub fn detect_now(&self) -> Vec<DeadlockEvent> {
        let _pass = self.pass_lock.lock();
        self.stats.passes.fetch_add(1, AtomicOrdering::Relaxed);

        if self.lock_manager.waiting_count() == 0 {
            return Vec::new();
        }

        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        let mut resolved = Vec::new();
        let mut victims = HashSet::new();

        for _ in 0..MAX_VICTIMS_PER_PASS {
            let graph = WaitForGraph::from_edges(&self.lock_manager.wait_for_edges());
            let Some(cycle) = graph.find_cycle() else {
                break;
            };
            self.stats.cycles_found.fetch_add(1, AtomicOrdering::Relaxed);

            let victim = select_victim(&cycle, handler.as_deref());
            if !victims.insert(victim) {
                // The previous rollback of this victim did not break the
                // cycle yet; leave it to the next pass.
                tracing::debug!(victim = %victim, "deadlock victim still in a cycle");
                break;
            }

            let rolled_back = match handler.as_deref() {
                Some(handler) => handler.rollback_victim(victim),
                None => false,
            };
            if !rolled_back {
                self.lock_manager
                    .cancel_wait(victim, CancelReason::DeadlockVictim);
            }
            self.stats.victims.fetch_add(1, AtomicOrdering::Relaxed);

            let event = DeadlockEvent {
                id: self.next_event_id.fetch_add(1, AtomicOrdering::Relaxed),
                detected_at: WallTime::now(),
                reason: format!(
                    "youngest of {} transactions in a wait cycle",
                    cycle.len()
                ),
                participants: cycle,
                victim,
            };
            tracing::warn!(
                id = event.id,
                victim = %victim,
                participants = ?event.participants,
                "deadlock detected, rolling back victim"
            );
            self.push_history(event.clone());
            resolved.push(event);
        }

        resolved
    }

    fn push_history(&self, event: DeadlockEvent) {
        let mut history = self.history.lock();
        while history.len() >= self.config.history_limit.max(1) {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Returns the resolved deadlocks, oldest first.
    pub fn history(&self) -> Vec<DeadlockEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Returns statistics.
    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }

    /// Starts the background detection thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<DetectorHandle> {
        let events = self.lock_manager.subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));
        let detector = Arc::clone(self);
        let flag = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("txcore-deadlock".into())
            .spawn(move || detector.run(&events, &flag))?;

        tracing::debug!(
            interval = ?self.config.check_interval,
            detect_on_block = self.config.detect_on_block,
            "deadlock detector started"
        );
        Ok(DetectorHandle {
            shutdown,
            thread: Some(thread),
        })
    }

    fn run(&self, events: &Receiver<WaitEvent>, shutdown: &AtomicBool) {
        let mut next_pass = Instant::now() + self.config.check_interval;
        let mut eager_pass: Option<Instant> = None;

        while !shutdown.load(AtomicOrdering::Acquire) {
            let now = Instant::now();
            let wake = eager_pass
                .map_or(next_pass, |at| at.min(next_pass))
                .min(now + SHUTDOWN_POLL);

            match events.recv_timeout(wake.saturating_duration_since(now)) {
                Ok(WaitEvent::Blocked { .. }) if self.config.detect_on_block => {
                    eager_pass.get_or_insert_with(|| Instant::now() + self.config.eager_delay);
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now >= next_pass || eager_pass.is_some_and(|at| now >= at) {
                eager_pass = None;
                next_pass = now + self.config.check_interval;
                self.detect_now();
            }
        }
        tracing::debug!("deadlock detector stopped");
    }
}

/// Picks the youngest transaction: latest begin, ties by larger id.
/// Transactions without a known begin count as the youngest.
fn select_victim(cycle: &[TxnId], handler: Option<&dyn VictimHandler>) -> TxnId {
    let now = Instant::now();
    cycle
        .iter()
        .copied()
        .max_by_key(|txn| {
            let started = handler.and_then(|h| h.started_at(*txn)).unwrap_or(now);
            (started, *txn)
        })
        .unwrap_or(TxnId::INVALID)
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("config", &self.config)
            .field("history", &self.history.lock().len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Handle to the background detection thread. Dropping it stops the
/// thread.
#[derive(Debug)]
pub struct DetectorHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DetectorHandle {
    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("deadlock detector thread panicked");
            }
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
