//! Vacuum: reclamation of versions no snapshot can see.
//!
//! # Overview
//!
//! A version becomes garbage once a committed transaction deleted or
//! superseded it *and* every live snapshot was taken after that commit.
//! The snapshot manager reports that boundary as the oldest active snapshot;
//! vacuum frees every version whose end timestamp is strictly below it.
//!
//! Runs are serialised: a second caller that arrives while a sweep is in
//! progress returns immediately with [`VacuumResult::skipped`] set.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use txcore_common::config::MvccConfig;
use txcore_common::types::{Timestamp, WallTime};
use txcore_common::DEFAULT_VACUUM_BATCH_SIZE;

use crate::snapshot::SnapshotManager;
use crate::version::VersionStore;

/// Configuration for vacuum.
#[derive(Debug, Clone)]
pub struct VacuumConfig {
    /// Maximum number of versions to reclaim per run.
    pub max_versions_per_run: usize,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            max_versions_per_run: DEFAULT_VACUUM_BATCH_SIZE,
        }
    }
}

impl From<&MvccConfig> for VacuumConfig {
    fn from(config: &MvccConfig) -> Self {
        Self {
            max_versions_per_run: config.vacuum_batch_size,
        }
    }
}

/// Statistics about vacuum.
#[derive(Debug, Default)]
pub struct VacuumStats {
    /// Total number of completed runs.
    pub runs: AtomicU64,
    /// Total versions reclaimed.
    pub versions_reclaimed: AtomicU64,
    /// Total chains pruned from the index.
    pub chains_pruned: AtomicU64,
    /// Chains inspected by the last run.
    pub last_scanned: AtomicUsize,
}

impl VacuumStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a vacuum run.
    pub fn record_run(&self, versions: usize, chains: usize, scanned: usize) {
        self.runs.fetch_add(1, AtomicOrdering::Relaxed);
        self.versions_reclaimed
            .fetch_add(versions as u64, AtomicOrdering::Relaxed);
        self.chains_pruned
            .fetch_add(chains as u64, AtomicOrdering::Relaxed);
        self.last_scanned.store(scanned, AtomicOrdering::Relaxed);
    }

    /// Returns the total number of runs.
    pub fn total_runs(&self) -> u64 {
        self.runs.load(AtomicOrdering::Relaxed)
    }

    /// Returns the total versions reclaimed.
    pub fn total_versions_reclaimed(&self) -> u64 {
        self.versions_reclaimed.load(AtomicOrdering::Relaxed)
    }

    /// Returns the total chains pruned.
    pub fn total_chains_pruned(&self) -> u64 {
        self.chains_pruned.load(AtomicOrdering::Relaxed)
    }
}

/// Result of a vacuum run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VacuumResult {
    /// Horizon the run used.
    pub horizon: Timestamp,
    /// Number of versions reclaimed.
    pub versions_reclaimed: usize,
    /// Number of empty chains pruned.
    pub chains_pruned: usize,
    /// Number of chains inspected.
    pub chains_scanned: usize,
    /// Wall time spent.
    pub duration: Duration,
    /// Whether the run was skipped because another was in progress.
    pub skipped: bool,
}

impl VacuumResult {
    /// Returns true if any work was done.
    pub fn did_work(&self) -> bool {
        !self.skipped && (self.versions_reclaimed > 0 || self.chains_pruned > 0)
    }
}

/// Vacuum progress summary for status output.
#[derive(Debug, Clone, Serialize)]
pub struct VacuumProgress {
    /// A run is executing right now.
    pub running: bool,
    /// Completed runs.
    pub runs: u64,
    /// Versions reclaimed since start.
    pub versions_reclaimed: u64,
    /// Chains pruned since start.
    pub chains_pruned: u64,
    /// Chains inspected by the last run.
    pub last_scanned: usize,
    /// When the last run finished.
    pub last_run: Option<WallTime>,
    /// Result of the last run.
    pub last_result: Option<VacuumResult>,
}

/// Reclaims dead versions from a version store.
pub struct Vacuum {
    store: Arc<VersionStore>,
    snapshots: Arc<SnapshotManager>,
    config: VacuumConfig,
    running: AtomicBool,
    last: Mutex<Option<(WallTime, VacuumResult)>>,
    stats: VacuumStats,
}

impl Vacuum {
    /// Creates a vacuum over `store`, bounded by `snapshots`.
    pub fn new(store: Arc<VersionStore>, snapshots: Arc<SnapshotManager>) -> Self {
        Self::with_config(store, snapshots, VacuumConfig::default())
    }

    /// Creates a vacuum with custom configuration.
    pub fn with_config(
        store: Arc<VersionStore>,
        snapshots: Arc<SnapshotManager>,
        config: VacuumConfig,
    ) -> Self {
        Self {
            store,
            snapshots,
            config,
            running: AtomicBool::new(false),
            last: Mutex::new(None),
            stats: VacuumStats::new(),
        }
    }

    /// Runs one vacuum pass at the current horizon.
    pub fn run(&self) -> VacuumResult {
        if self
            .running
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return VacuumResult {
                skipped: true,
                ..VacuumResult::default()
            };
        }

        let start = Instant::now();
        let horizon = self.snapshots.oldest_active_snapshot();
        let sweep = self.store.sweep(horizon, self.config.max_versions_per_run);
        let result = VacuumResult {
            horizon,
            versions_reclaimed: sweep.versions_reclaimed,
            chains_pruned: sweep.chains_pruned,
            chains_scanned: sweep.chains_scanned,
            duration: start.elapsed(),
            skipped: false,
        };

        self.stats.record_run(
            result.versions_reclaimed,
            result.chains_pruned,
            result.chains_scanned,
        );
        *self.last.lock() = Some((WallTime::now(), result));
        self.running.store(false, AtomicOrdering::Release);

        if result.did_work() {
            tracing::debug!(
                horizon = %horizon,
                reclaimed = result.versions_reclaimed,
                pruned = result.chains_pruned,
                "vacuum pass finished"
            );
        }
        result
    }

    /// Returns true while a pass is executing.
    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &VacuumStats {
        &self.stats
    }

    /// Returns a progress summary.
    pub fn progress(&self) -> VacuumProgress {
        let last = *self.last.lock();
        VacuumProgress {
            running: self.is_running(),
            runs: self.stats.total_runs(),
            versions_reclaimed: self.stats.total_versions_reclaimed(),
            chains_pruned: self.stats.total_chains_pruned(),
            last_scanned: self.stats.last_scanned.load(AtomicOrdering::Relaxed),
            last_run: last.map(|(at, _)| at),
            last_result: last.map(|(_, result)| result),
        }
    }
}

impl fmt::Debug for Vacuum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vacuum")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("runs", &self.stats.total_runs())
            .finish()
    }
}
