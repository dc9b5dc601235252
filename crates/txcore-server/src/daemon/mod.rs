//! The daemon runtime.
//!
//! [`Daemon`] owns a recovered [`TransactionManager`] and drives the
//! periodic work the core does not schedule itself: vacuum passes and
//! status summaries. Both run as tokio interval tasks; the blocking core
//! calls are moved onto the blocking pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use txcore_txn::{SystemStatus, TransactionManager};
use txcore_wal::RecoveryReport;

use crate::config::ServerConfig;

/// A running transaction core plus its periodic tasks.
pub struct Daemon {
    config: ServerConfig,
    manager: Arc<TransactionManager>,
    report: RecoveryReport,
}

impl Daemon {
    /// Recovers the WAL and opens the core. Starts the deadlock detector
    /// when the configuration enables it.
    pub fn open(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let core = config.core_config();
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        }

        let (manager, report) = TransactionManager::open(&core)
            .with_context(|| format!("failed to open WAL in {}", core.wal.dir.display()))?;

        info!(
            wal_dir = %core.wal.dir.display(),
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            incomplete = report.incomplete.len(),
            segments = report.segments_scanned,
            next_lsn = %report.next_lsn,
            "recovery complete"
        );
        if report.torn_tail.is_some() {
            warn!("WAL ended in a torn record; the partial tail was discarded");
        }

        Ok(Self {
            config,
            manager,
            report,
        })
    }

    /// Returns the transaction manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Returns what recovery found.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the current status.
    pub fn status(&self) -> SystemStatus {
        self.manager.status()
    }

    /// Returns the current status as pretty-printed JSON.
    pub fn status_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.status()).context("failed to encode status")
    }

    /// Runs the periodic tasks until `shutdown` resolves, then aborts every
    /// live transaction and closes the WAL.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = Vec::new();
        if self.config.core.mvcc.auto_vacuum {
            tasks.push(spawn_vacuum(
                Arc::clone(&self.manager),
                self.config.core.mvcc.vacuum_interval,
            ));
        }
        if let Some(interval) = self.config.status_interval() {
            tasks.push(spawn_status_logger(Arc::clone(&self.manager), interval));
        }

        shutdown.await;
        info!("Shutting down gracefully...");

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Aborted tasks resolve to a cancellation error.
            let _ = task.await;
        }

        let manager = self.manager;
        let active = manager.active_count();
        if active > 0 {
            warn!("Rolling back {} active transactions", active);
        }
        tokio::task::spawn_blocking(move || manager.shutdown())
            .await
            .context("shutdown task panicked")?
            .context("failed to close the WAL")?;
        Ok(())
    }
}

fn spawn_vacuum(manager: Arc<TransactionManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let manager = Arc::clone(&manager);
            match tokio::task::spawn_blocking(move || manager.vacuum_now()).await {
                Ok(result) if result.skipped => debug!("vacuum pass skipped, previous still running"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "vacuum task failed"),
            }
        }
    })
}

fn spawn_status_logger(manager: Arc<TransactionManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_summary(&manager);
        }
    })
}

fn log_summary(manager: &TransactionManager) {
    let txns = manager.stats().snapshot();
    let mvcc = manager.mvcc_status();
    let wal = manager.wal_status();
    let deadlocks = manager.deadlock_detector().stats().snapshot();
    info!(
        active = manager.active_count(),
        committed = txns.committed,
        aborted = txns.aborted,
        locks = manager.lock_manager().lock_count(),
        waiting = manager.lock_manager().waiting_count(),
        deadlock_victims = deadlocks.victims,
        versions = mvcc.versions.live_versions,
        oldest_snapshot = %mvcc.oldest_snapshot,
        flushed_lsn = %wal.flush_lsn,
        "status"
    );
}
