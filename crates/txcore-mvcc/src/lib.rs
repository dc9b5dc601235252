//! # txcore-mvcc
//!
//! Multi-version concurrency control for txcore.
//!
//! This crate implements:
//! - A logical commit clock
//! - Arena-backed version chains indexed by row key
//! - Snapshots, the oldest-snapshot horizon and serializable validation
//! - Vacuum of versions no snapshot can see

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Logical commit clock
pub mod clock;

/// MVCC error types
pub mod error;

/// Version chain storage
pub mod version;

/// Snapshot isolation
pub mod snapshot;

/// Reclamation of dead versions
pub mod vacuum;

pub use clock::LogicalClock;
pub use error::{MvccError, MvccResult};
pub use snapshot::{Snapshot, SnapshotInfo, SnapshotManager};
pub use vacuum::{Vacuum, VacuumConfig, VacuumProgress, VacuumResult, VacuumStats};
pub use version::{
    Version, VersionId, VersionInfo, VersionState, VersionStore, VersionStoreStats, WriteEntry,
    WriteKind,
};
