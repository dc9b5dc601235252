//! Helpers shared by the integration tests.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use txcore_common::config::CoreConfig;
use txcore_common::types::{RowKey, TableId, TxnId};
use txcore_txn::TransactionManager;
use txcore_wal::RecoveryReport;

/// Table id used for the `users` table in scenarios.
pub const USERS: TableId = TableId::new(1);

/// Returns the key of row `row` in the `users` table.
pub fn users(row: u64) -> RowKey {
    RowKey::new(USERS, row)
}

/// Polls `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// A transaction core over a private WAL directory.
pub struct TestCore {
    dir: TempDir,
    config: CoreConfig,
    manager: Arc<TransactionManager>,
    report: RecoveryReport,
}

impl TestCore {
    /// Opens a core with the background deadlock detector disabled.
    pub fn new() -> Self {
        Self::with_config(|config| config.deadlock.enabled = false)
    }

    /// Opens a core with test defaults adjusted by `tune`.
    pub fn with_config(tune: impl FnOnce(&mut CoreConfig)) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = CoreConfig::for_testing(dir.path().join("wal"));
        tune(&mut config);
        let (manager, report) = TransactionManager::open(&config).expect("open core");
        Self {
            dir,
            config,
            manager,
            report,
        }
    }

    /// Returns the transaction manager.
    pub fn tm(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Returns what recovery found when this core was opened.
    pub fn report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Shuts the core down and opens it again over the same WAL.
    pub fn restart(self) -> Self {
        self.manager.shutdown().expect("shutdown");
        drop(self.manager);
        let (manager, report) = TransactionManager::open(&self.config).expect("reopen core");
        Self {
            dir: self.dir,
            config: self.config,
            manager,
            report,
        }
    }

    /// Shuts the core down, runs `tamper` on the WAL directory while
    /// nothing has it open, then opens the core again.
    pub fn restart_with(self, tamper: impl FnOnce(&Path)) -> Self {
        self.manager.shutdown().expect("shutdown");
        drop(self.manager);
        tamper(&self.config.wal.dir);
        let (manager, report) = TransactionManager::open(&self.config).expect("reopen core");
        Self {
            dir: self.dir,
            config: self.config,
            manager,
            report,
        }
    }

    /// Returns the WAL directory.
    pub fn wal_dir(&self) -> &Path {
        &self.config.wal.dir
    }

    /// Drops the core without shutting it down, then opens it again.
    /// Live transactions vanish the way they would in a crash.
    pub fn crash_and_reopen(self) -> Self {
        drop(self.manager);
        let (manager, report) = TransactionManager::open(&self.config).expect("reopen core");
        Self {
            dir: self.dir,
            config: self.config,
            manager,
            report,
        }
    }

    /// Waits until `txn` is queued on a lock.
    pub fn wait_until_blocked(&self, txn: TxnId) {
        let locks = self.manager.lock_manager();
        assert!(
            wait_until(Duration::from_secs(5), || locks.waiting_on(txn).is_some()),
            "transaction {txn} never blocked"
        );
    }
}

impl Default for TestCore {
    fn default() -> Self {
        Self::new()
    }
}
