//! Errors returned by the transaction manager.

use std::time::Duration;

use thiserror::Error;
use txcore_common::types::{RowKey, TxnId};
use txcore_common::{ConfigError, ErrorCode};
use txcore_mvcc::MvccError;
use txcore_wal::WalError;

use crate::lock::ResourceId;
use crate::manager::TransactionState;

/// Result type for transaction operations.
pub type TxnResult<T> = std::result::Result<T, TxnError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TxnError {
    /// A lock could not be acquired in time. The transaction stays usable.
    #[error("transaction {txn_id} timed out after {waited:?} waiting for a lock on {resource}")]
    LockTimeout {
        /// Waiting transaction.
        txn_id: TxnId,
        /// Contended resource.
        resource: ResourceId,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The transaction was rolled back to break a deadlock.
    #[error("transaction {0} was rolled back as deadlock victim")]
    DeadlockVictim(TxnId),

    /// Serializable validation failed; the transaction has been aborted.
    #[error("could not serialize transaction {txn_id}: {key} was changed by concurrent transaction {conflicting}")]
    SerializationFailure {
        /// Aborted transaction.
        txn_id: TxnId,
        /// Transaction that committed first.
        conflicting: TxnId,
        /// Row both transactions touched.
        key: RowKey,
    },

    /// The WAL rejected a record or failed to make it durable.
    #[error("WAL write failed: {0}")]
    WalWriteFailure(#[source] WalError),

    /// The live transaction limit was reached.
    #[error("too many active transactions (limit {limit})")]
    TooManyActiveTransactions {
        /// Configured limit.
        limit: usize,
    },

    /// No live transaction has this id.
    #[error("transaction {0} not found")]
    NotFound(TxnId),

    /// The operation is not allowed in the transaction's current state.
    #[error("cannot {operation} transaction {txn_id} in state {state}")]
    InvalidState {
        /// The transaction.
        txn_id: TxnId,
        /// Its current state.
        state: TransactionState,
        /// What was attempted.
        operation: &'static str,
    },

    /// The transaction was aborted by another party while this call ran.
    #[error("transaction {0} was aborted")]
    Aborted(TxnId),

    /// The isolation level can no longer change.
    #[error("isolation level of transaction {0} can only change before its first statement")]
    IsolationLevelFixed(TxnId),

    /// An operator released a lock the running operation relied on. The
    /// transaction stays usable.
    #[error("lock on {resource} held by transaction {txn_id} was released by an operator")]
    LockReleased {
        /// The transaction.
        txn_id: TxnId,
        /// Released resource.
        resource: ResourceId,
    },

    /// The lock protects writes that are not committed yet.
    #[error("lock on {resource} protects uncommitted writes of transaction {txn_id}")]
    LockProtectsWrites {
        /// The transaction.
        txn_id: TxnId,
        /// Locked resource.
        resource: ResourceId,
    },

    /// No savepoint with this name exists.
    #[error("savepoint {name:?} does not exist in transaction {txn_id}")]
    SavepointNotFound {
        /// The transaction.
        txn_id: TxnId,
        /// Requested savepoint.
        name: String,
    },

    /// A version store or snapshot error.
    #[error(transparent)]
    Mvcc(MvccError),

    /// A WAL maintenance operation failed.
    #[error("WAL error: {0}")]
    Log(#[source] WalError),

    /// Replaying the WAL failed at startup.
    #[error("recovery failed: {0}")]
    Recovery(#[source] WalError),

    /// A background worker could not be started.
    #[error("failed to start {name}: {source}")]
    Spawn {
        /// Worker name.
        name: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<MvccError> for TxnError {
    fn from(err: MvccError) -> Self {
        match err {
            MvccError::SerializationFailure {
                txn_id,
                conflicting,
                key,
            } => TxnError::SerializationFailure {
                txn_id,
                conflicting,
                key,
            },
            MvccError::TransactionNotFound(txn_id) => TxnError::NotFound(txn_id),
            other => TxnError::Mvcc(other),
        }
    }
}

impl TxnError {
    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            TxnError::LockTimeout { .. } => ErrorCode::LockTimeout,
            TxnError::DeadlockVictim(_) => ErrorCode::DeadlockVictim,
            TxnError::SerializationFailure { .. } => ErrorCode::SerializationFailure,
            TxnError::WalWriteFailure(_) => ErrorCode::WalWriteFailed,
            TxnError::TooManyActiveTransactions { .. } => ErrorCode::TooManyActiveTransactions,
            TxnError::NotFound(_) => ErrorCode::TransactionNotFound,
            TxnError::InvalidState { .. } => ErrorCode::InvalidTransactionState,
            TxnError::Aborted(_) => ErrorCode::TransactionAborted,
            TxnError::IsolationLevelFixed(_) | TxnError::LockProtectsWrites { .. } => {
                ErrorCode::InvalidTransactionState
            }
            TxnError::LockReleased { .. } => ErrorCode::Cancelled,
            TxnError::SavepointNotFound { .. } => ErrorCode::SavepointNotFound,
            TxnError::Mvcc(err) => err.code(),
            TxnError::Log(err) | TxnError::Recovery(err) => err.code(),
            TxnError::Spawn { .. } => ErrorCode::Internal,
            TxnError::Config(err) => err.code(),
        }
    }

    /// Returns true if running the transaction again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxnError::LockTimeout { .. }
                | TxnError::DeadlockVictim(_)
                | TxnError::SerializationFailure { .. }
                | TxnError::TooManyActiveTransactions { .. }
                | TxnError::LockReleased { .. }
        )
    }
}
