//! # txcore-txn
//!
//! Transaction coordination for txcore.
//!
//! This crate ties the MVCC version store and the WAL together with:
//!
//! - **Transaction Lifecycle**: Begin, statements, savepoints, commit and
//!   abort, with recovery of committed work from the WAL on open.
//!
//! - **Isolation Levels**: Read Uncommitted, Read Committed, Repeatable
//!   Read and Serializable (first committer wins).
//!
//! - **Lock Management**: Hierarchical table and row locks in the IS, IX,
//!   S, SIX and X modes with FIFO queues, upgrades and timeouts.
//!
//! - **Deadlock Detection**: A background wait-for graph check that rolls
//!   back the youngest transaction of every cycle.
//!
//! - **Status and Admin**: Serializable views of every component and
//!   operator actions (forced rollback, vacuum, detection passes).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    TransactionManager                          │
//! │                           │                                    │
//! │    ┌──────────────────────┼──────────────────────┐             │
//! │    │                      │                      │             │
//! │    ▼                      ▼                      ▼             │
//! │ ┌──────────┐    ┌─────────────────┐    ┌──────────────────┐   │
//! │ │ Logical  │    │  VersionStore   │    │   LockManager    │   │
//! │ │  Clock   │    │   (from MVCC)   │    │                  │   │
//! │ └──────────┘    └─────────────────┘    └──────────────────┘   │
//! │      │                   │                      │              │
//! │      ▼                   ▼                      ▼              │
//! │ ┌─────────────────┐ ┌──────────┐    ┌──────────────────┐      │
//! │ │ SnapshotManager │ │  Vacuum  │    │ DeadlockDetector │      │
//! │ │   (from MVCC)   │ │          │    │                  │      │
//! │ └─────────────────┘ └──────────┘    └──────────────────┘      │
//! │                           │                                    │
//! │                           ▼                                    │
//! │                   ┌───────────────┐                            │
//! │                   │ CommitLog/WAL │                            │
//! │                   └───────────────┘                            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use bytes::Bytes;
//! use txcore_common::config::CoreConfig;
//! use txcore_common::types::{IsolationLevel, RowKey, TableId};
//! use txcore_txn::TransactionManager;
//!
//! let config = CoreConfig::with_wal_dir("/var/lib/txcore/wal");
//! let (tm, _report) = TransactionManager::open(&config)?;
//!
//! let users = TableId::new(1);
//! let txn = tm.begin(IsolationLevel::ReadCommitted)?;
//! tm.write(txn, RowKey::new(users, 1), Bytes::from("alice"))?;
//! tm.commit(txn)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Transaction lifecycle management.
///
/// This module provides:
/// - [`manager::TransactionManager`]: Main coordinator for transactions
/// - [`manager::TransactionState`]: Transaction lifecycle states
/// - [`manager::TxnError`]: Errors returned to callers
pub mod manager;

/// Lock table implementation.
///
/// This module provides:
/// - [`lock::LockManager`]: Manages all locks
/// - [`lock::LockMode`]: Shared, Exclusive, and intention locks
/// - [`lock::ResourceId`]: Identifies lockable resources
pub mod lock;

/// Deadlock detection.
///
/// This module provides:
/// - [`deadlock::WaitForGraph`]: Tracks transaction dependencies
/// - [`deadlock::DeadlockDetector`]: Detects and resolves deadlocks
/// - [`deadlock::DeadlockEvent`]: A resolved deadlock
pub mod deadlock;

/// Status views over the running core.
pub mod status;

/// Operator actions.
pub mod admin;

// Re-export commonly used types

pub use manager::{
    FinishedTransaction, RollbackOutcome, TransactionManager, TransactionManagerConfig,
    TransactionState, TransactionStats, TransactionStatsSnapshot, TxnError, TxnResult,
};

pub use lock::{
    CancelReason, Escalation, LockError, LockGrant, LockManager, LockManagerConfig, LockMode,
    LockResult, LockStats, LockTreeNode, ResourceId, WaitEdge, WaitingOn,
};

pub use deadlock::{
    DeadlockDetector, DeadlockDetectorConfig, DeadlockEvent, DeadlockStats, DetectorHandle,
    VictimHandler, WaitForGraph,
};

pub use status::{ActiveTransactionInfo, HeldLock, LockWaitGraph, MvccStatus, SystemStatus};
