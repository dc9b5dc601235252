//! System-wide constants for txcore.
//!
//! This module defines constants and defaults used across the core.

// =============================================================================
// Lock Manager Constants
// =============================================================================

/// Lock acquisition timeout (default).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000; // 10 seconds

/// Number of independently locked partitions of the lock table.
pub const LOCK_TABLE_SHARDS: usize = 64;

/// Row locks one transaction may hold on a table before they are
/// escalated to a table lock.
pub const LOCK_ESCALATION_THRESHOLD: usize = 1000;

// =============================================================================
// Deadlock Detector Constants
// =============================================================================

/// Interval between background deadlock detection passes.
pub const DEFAULT_DEADLOCK_INTERVAL_MS: u64 = 1_000;

/// Delay between a blocking acquire and the eager detection pass it triggers.
pub const DEFAULT_DEADLOCK_EAGER_DELAY_MS: u64 = 20;

/// Number of resolved deadlocks kept for the status history.
pub const DEADLOCK_HISTORY_LIMIT: usize = 100;

/// Upper bound on victims chosen in one detection pass.
pub const MAX_VICTIMS_PER_PASS: usize = 64;

// =============================================================================
// Transaction Constants
// =============================================================================

/// Maximum number of concurrent transactions.
pub const MAX_CONCURRENT_TRANSACTIONS: usize = 65536;

/// Number of finished transactions remembered for status and idempotent
/// administrative rollback.
pub const FINISHED_TRANSACTION_HISTORY: usize = 1024;

// =============================================================================
// MVCC Constants
// =============================================================================

/// Interval between background vacuum passes.
pub const DEFAULT_VACUUM_INTERVAL_MS: u64 = 10_000;

/// Maximum number of versions reclaimed in one vacuum pass.
pub const DEFAULT_VACUUM_BATCH_SIZE: usize = 10_000;

// =============================================================================
// WAL Constants
// =============================================================================

/// Default WAL segment size (64 MB).
pub const DEFAULT_WAL_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Smallest accepted WAL segment size (1 MB).
pub const MIN_WAL_SEGMENT_SIZE: usize = 1024 * 1024;

/// Maximum WAL record size (10 MB).
pub const MAX_WAL_RECORD_SIZE: usize = 10 * 1024 * 1024;

/// WAL record header size.
///
/// Contains: lsn (8), prev_lsn (8), txn_id (8), type (1), flags (1),
/// length (4), checksum (4) = 34 bytes, rounded to 40.
pub const WAL_RECORD_HEADER_SIZE: usize = 40;

/// Magic number for WAL segment header.
pub const WAL_MAGIC: u32 = 0x5458_5741; // "TXWA" in ASCII

/// Version number of the WAL record format.
pub const WAL_FORMAT_VERSION: u16 = 1;

/// Default in-memory WAL buffer size before records spill to the file.
pub const DEFAULT_WAL_BUFFER_SIZE: usize = 1024 * 1024;

/// Default window a group commit leader waits to collect followers.
pub const DEFAULT_GROUP_COMMIT_DELAY_US: u64 = 200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_sanity() {
        assert!(LOCK_TABLE_SHARDS.is_power_of_two());
        assert!(MAX_WAL_RECORD_SIZE < DEFAULT_WAL_SEGMENT_SIZE);
        assert_eq!(WAL_RECORD_HEADER_SIZE % 8, 0);
        assert!(DEFAULT_DEADLOCK_EAGER_DELAY_MS < DEFAULT_DEADLOCK_INTERVAL_MS);
    }
}
