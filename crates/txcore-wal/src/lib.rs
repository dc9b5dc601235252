//! # txcore-wal
//!
//! Write-ahead logging for the transaction core.
//!
//! This crate implements a redo log with:
//! - Monotonic LSNs, one per record
//! - Group commit: concurrent flush requests share one fsync
//! - Segment rotation
//! - Replay that groups records by transaction and honours compensation
//!
//! # Architecture
//!
//! The WAL is organized into segments (default 64 MB each). Each segment
//! contains a sequence of records, starting with a segment header record.
//!
//! ## Record Format
//!
//! Each record consists of a 40-byte header followed by a variable-length payload:
//!
//! ```text
//! +----------+------------+---------+----------+-----------+------+-------+--------------+
//! | CRC (4)  | Length (4) | LSN (8) | Prev (8) | TxnId (8) | Type | Flags | Reserved (6) |
//! +----------+------------+---------+----------+-----------+------+-------+--------------+
//! |                                  Payload (variable)                                  |
//! +--------------------------------------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// WAL record types and serialization.
pub mod record;

/// WAL segment files.
pub mod segment;

/// Record appends and segment rotation.
pub mod writer;

/// Sequential reading of segments.
pub mod reader;

/// Group commit implementation.
pub mod group_commit;

/// Replay of the log after a restart.
pub mod recovery;

/// Main WAL manager.
pub mod wal;

pub use config::{SyncPolicy, WalConfig};
pub use error::{WalError, WalResult};
pub use record::{
    CommitPayload, CompensationPayload, DeletePayload, InsertPayload, RecordFlags, RecordHeader,
    RecordType, UpdatePayload, WalPayload, WalRecord,
};
pub use recovery::{RecoveredTxn, RecoveryReport, RedoOp, TornTail};
pub use segment::{SegmentInfo, SegmentSwitch};
pub use wal::{CommitLog, Wal, WalStatsSnapshot};
