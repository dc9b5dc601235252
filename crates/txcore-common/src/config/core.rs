//! Core configuration structures.
//!
//! These structures define all configurable aspects of the transaction
//! core. They are plain serde types so they can be embedded in the daemon's
//! TOML file; each component converts its section into a runtime config.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEADLOCK_HISTORY_LIMIT, DEFAULT_DEADLOCK_EAGER_DELAY_MS, DEFAULT_DEADLOCK_INTERVAL_MS,
    DEFAULT_GROUP_COMMIT_DELAY_US, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_VACUUM_BATCH_SIZE,
    DEFAULT_VACUUM_INTERVAL_MS, DEFAULT_WAL_BUFFER_SIZE, DEFAULT_WAL_SEGMENT_SIZE,
    FINISHED_TRANSACTION_HISTORY, LOCK_ESCALATION_THRESHOLD, LOCK_TABLE_SHARDS,
    MAX_CONCURRENT_TRANSACTIONS, MIN_WAL_SEGMENT_SIZE,
};
use crate::error::{ConfigError, ConfigResult};
use crate::types::IsolationLevel;

/// Top-level configuration of the transaction core.
///
/// # Example
///
/// ```rust
/// use txcore_common::config::CoreConfig;
///
/// let config = CoreConfig::default();
/// assert_eq!(config.lock.shards, 64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Lock manager configuration.
    pub lock: LockConfig,
    /// Deadlock detector configuration.
    pub deadlock: DeadlockConfig,
    /// MVCC and vacuum configuration.
    pub mvcc: MvccConfig,
    /// Write-ahead log configuration.
    pub wal: WalConfig,
    /// Transaction manager configuration.
    pub txn: TxnConfig,
}

impl CoreConfig {
    /// Creates a configuration with the WAL placed in `dir`.
    #[must_use]
    pub fn with_wal_dir(dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.wal.dir = dir.into();
        config
    }

    /// Creates a configuration tuned for tests: short timeouts, fast
    /// detection, no fsync.
    #[must_use]
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            lock: LockConfig {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
            deadlock: DeadlockConfig {
                interval: Duration::from_millis(50),
                ..Default::default()
            },
            mvcc: MvccConfig {
                auto_vacuum: false,
                ..Default::default()
            },
            wal: WalConfig {
                dir: dir.into(),
                sync: SyncPolicy::Never,
                segment_size: 1024 * 1024,
                ..Default::default()
            },
            txn: TxnConfig::default(),
        }
    }

    /// Validates every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.lock.validate()?;
        self.deadlock.validate()?;
        self.mvcc.validate()?;
        self.wal.validate()?;
        self.txn.validate()
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lock wait timeout.
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Number of lock table shards. Must be a power of 2.
    /// Default: 64
    pub shards: usize,

    /// Row locks on one table after which a transaction tries to take a
    /// table lock instead. 0 disables escalation.
    /// Default: 1000
    pub escalation_threshold: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            shards: LOCK_TABLE_SHARDS,
            escalation_threshold: LOCK_ESCALATION_THRESHOLD,
        }
    }
}

impl LockConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(ConfigError::invalid(
                "lock.shards",
                format!("{} is not a power of two", self.shards),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("lock.timeout", "must be positive"));
        }
        Ok(())
    }
}

/// Deadlock detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Run the background detector.
    /// Default: true
    pub enabled: bool,

    /// Interval between detection passes.
    /// Default: 1s
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Schedule an extra pass shortly after a transaction blocks.
    /// Default: true
    pub detect_on_block: bool,

    /// Delay between a block and the eager pass.
    /// Default: 20ms
    #[serde(with = "humantime_serde")]
    pub eager_delay: Duration,

    /// Number of deadlock events kept in the history.
    /// Default: 100
    pub history_limit: usize,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(DEFAULT_DEADLOCK_INTERVAL_MS),
            detect_on_block: true,
            eager_delay: Duration::from_millis(DEFAULT_DEADLOCK_EAGER_DELAY_MS),
            history_limit: DEADLOCK_HISTORY_LIMIT,
        }
    }
}

impl DeadlockConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("deadlock.interval", "must be positive"));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::invalid(
                "deadlock.history_limit",
                "must keep at least one event",
            ));
        }
        Ok(())
    }
}

/// MVCC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MvccConfig {
    /// Run vacuum periodically.
    /// Default: true
    pub auto_vacuum: bool,

    /// Interval between vacuum passes.
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub vacuum_interval: Duration,

    /// Maximum number of versions reclaimed per pass.
    /// Default: 10000
    pub vacuum_batch_size: usize,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            auto_vacuum: true,
            vacuum_interval: Duration::from_millis(DEFAULT_VACUUM_INTERVAL_MS),
            vacuum_batch_size: DEFAULT_VACUUM_BATCH_SIZE,
        }
    }
}

impl MvccConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.vacuum_batch_size == 0 {
            return Err(ConfigError::invalid(
                "mvcc.vacuum_batch_size",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// When the WAL forces data to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every appended record.
    EveryWrite,
    /// Coalesce concurrent flush requests into one sync.
    #[default]
    GroupCommit,
    /// Never sync (testing only).
    Never,
}

/// Write-ahead log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// WAL directory.
    pub dir: PathBuf,

    /// Maximum WAL segment size in bytes.
    /// Default: 67108864 (64 MB)
    pub segment_size: usize,

    /// Sync policy.
    /// Default: group_commit
    pub sync: SyncPolicy,

    /// Group commit delay (wait for more transactions).
    /// Default: 200us
    #[serde(with = "humantime_serde")]
    pub group_commit_delay: Duration,

    /// In-memory buffer size before records spill to the segment file.
    /// Default: 1048576 (1 MB)
    pub buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            sync: SyncPolicy::GroupCommit,
            group_commit_delay: Duration::from_micros(DEFAULT_GROUP_COMMIT_DELAY_US),
            buffer_size: DEFAULT_WAL_BUFFER_SIZE,
        }
    }
}

impl WalConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.segment_size < MIN_WAL_SEGMENT_SIZE {
            return Err(ConfigError::invalid(
                "wal.segment_size",
                format!("{} is below {MIN_WAL_SEGMENT_SIZE}", self.segment_size),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("wal.buffer_size", "must be positive"));
        }
        Ok(())
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Maximum number of live transactions.
    /// Default: 65536
    pub max_active_transactions: usize,

    /// Isolation used when the caller does not name one.
    /// Default: read_committed
    pub default_isolation: IsolationLevel,

    /// Finished transactions remembered for status queries.
    /// Default: 1024
    pub finished_history: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_active_transactions: MAX_CONCURRENT_TRANSACTIONS,
            default_isolation: IsolationLevel::default(),
            finished_history: FINISHED_TRANSACTION_HISTORY,
        }
    }
}

impl TxnConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_active_transactions == 0 {
            return Err(ConfigError::invalid(
                "txn.max_active_transactions",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration using humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.lock.timeout, Duration::from_secs(10));
        assert_eq!(config.deadlock.interval, Duration::from_secs(1));
        assert_eq!(config.wal.sync, SyncPolicy::GroupCommit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CoreConfig::default();
        config.lock.shards = 48;
        assert!(config.validate().is_err());

        config.lock.shards = 32;
        config.txn.max_active_transactions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_testing_config() {
        let config = CoreConfig::for_testing("/tmp/txcore_test");
        assert_eq!(config.wal.sync, SyncPolicy::Never);
        assert!(!config.mvcc.auto_vacuum);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_sections() {
        let text = r#"
            [lock]
            timeout = "250ms"
            escalation_threshold = 0

            [wal]
            dir = "/var/lib/txcore/wal"
            sync = "every_write"

            [txn]
            default_isolation = "serializable"
        "#;
        let config: CoreConfig = toml::from_str(text).unwrap();
        assert_eq!(config.lock.timeout, Duration::from_millis(250));
        assert_eq!(config.lock.shards, LOCK_TABLE_SHARDS);
        assert_eq!(config.lock.escalation_threshold, 0);
        assert_eq!(config.wal.sync, SyncPolicy::EveryWrite);
        assert_eq!(config.txn.default_isolation, IsolationLevel::Serializable);
    }

    #[test]
    fn test_json_roundtrip_keeps_durations() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"interval\":\"1s\""));
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.deadlock.interval, config.deadlock.interval);
    }
}
