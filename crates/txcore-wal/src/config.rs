//! Runtime configuration for the log.
//!
//! Built from the `[wal]` section of `CoreConfig`, then tuned with the
//! `with_*` builders in tests and benches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use txcore_common::config::WalConfig as WalSection;
use txcore_common::constants::{
    DEFAULT_GROUP_COMMIT_DELAY_US, DEFAULT_WAL_BUFFER_SIZE, DEFAULT_WAL_SEGMENT_SIZE,
    MAX_WAL_RECORD_SIZE, MIN_WAL_SEGMENT_SIZE,
};

use crate::error::{WalError, WalResult};

pub use txcore_common::config::SyncPolicy;

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_EXTENSION: &str = "log";
const MIN_WRITE_BUFFER_SIZE: usize = 4096;

/// Log configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Rotation threshold in bytes.
    pub segment_size: usize,
    /// Largest encoded record accepted by `append`.
    pub max_record_size: usize,
    /// When appends become durable.
    pub sync_policy: SyncPolicy,
    /// How long a flush leader lingers so followers can join its batch.
    pub group_commit_delay: Duration,
    /// Buffered bytes that force a write to the segment file.
    pub write_buffer_size: usize,
    /// Reject records whose CRC does not match while reading.
    pub verify_checksums: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            max_record_size: MAX_WAL_RECORD_SIZE,
            sync_policy: SyncPolicy::default(),
            group_commit_delay: Duration::from_micros(DEFAULT_GROUP_COMMIT_DELAY_US),
            write_buffer_size: DEFAULT_WAL_BUFFER_SIZE,
            verify_checksums: true,
        }
    }
}

impl From<&WalSection> for WalConfig {
    fn from(section: &WalSection) -> Self {
        Self {
            dir: section.dir.clone(),
            segment_size: section.segment_size,
            max_record_size: MAX_WAL_RECORD_SIZE.min(section.segment_size / 2),
            sync_policy: section.sync,
            group_commit_delay: section.group_commit_delay,
            write_buffer_size: section.buffer_size,
            verify_checksums: true,
        }
    }
}

impl WalConfig {
    /// Defaults rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    #[must_use]
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    #[must_use]
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    #[must_use]
    pub fn with_group_commit_delay(mut self, delay: Duration) -> Self {
        self.group_commit_delay = delay;
        self
    }

    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Checks that segments can hold records and the buffer is usable.
    pub fn validate(&self) -> WalResult<()> {
        if self.segment_size < MIN_WAL_SEGMENT_SIZE {
            return Err(WalError::config_error(format!(
                "segment_size {} is below the minimum of {MIN_WAL_SEGMENT_SIZE}",
                self.segment_size
            )));
        }
        if self.max_record_size > self.segment_size / 2 {
            return Err(WalError::config_error(format!(
                "max_record_size {} exceeds half of segment_size {}",
                self.max_record_size, self.segment_size
            )));
        }
        if self.write_buffer_size < MIN_WRITE_BUFFER_SIZE {
            return Err(WalError::config_error(format!(
                "write_buffer_size {} is below {MIN_WRITE_BUFFER_SIZE}",
                self.write_buffer_size
            )));
        }
        Ok(())
    }

    /// Path of segment `segment_id`: `wal_{id:016x}.log` under `dir`.
    pub fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.dir
            .join(format!("{SEGMENT_PREFIX}{segment_id:016x}.{SEGMENT_EXTENSION}"))
    }

    /// Inverse of [`segment_path`](Self::segment_path); `None` for any
    /// other file.
    pub fn parse_segment_id(path: &Path) -> Option<u64> {
        if path.extension()? != SEGMENT_EXTENSION {
            return None;
        }
        let hex = path.file_stem()?.to_str()?.strip_prefix(SEGMENT_PREFIX)?;
        u64::from_str_radix(hex, 16).ok()
    }

    /// False only under `SyncPolicy::Never`.
    pub fn syncs(&self) -> bool {
        self.sync_policy != SyncPolicy::Never
    }
}
