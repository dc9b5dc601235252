//! Error types for MVCC operations.

use thiserror::Error;
use txcore_common::types::{RowKey, TxnId};
use txcore_common::ErrorCode;

use crate::version::VersionId;

/// Result type for MVCC operations.
pub type MvccResult<T> = std::result::Result<T, MvccError>;

/// Errors raised by the version store and snapshot manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MvccError {
    /// Another transaction has an uncommitted change on the row.
    #[error("write conflict on {key}: row has uncommitted changes from transaction {holder}")]
    WriteConflict {
        /// Contended row.
        key: RowKey,
        /// Transaction owning the pending change.
        holder: TxnId,
    },

    /// A concurrent commit invalidated what this transaction read or wrote.
    #[error("serialization failure for transaction {txn_id}: {key} was written by concurrent transaction {conflicting}")]
    SerializationFailure {
        /// Transaction being validated.
        txn_id: TxnId,
        /// Transaction that committed (or is committing) first.
        conflicting: TxnId,
        /// Row both transactions touched.
        key: RowKey,
    },

    /// The transaction is not registered with the snapshot manager.
    #[error("transaction {0} is not registered")]
    TransactionNotFound(TxnId),

    /// The version id does not refer to a live version.
    #[error("version {0} not found")]
    VersionNotFound(VersionId),
}

impl MvccError {
    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::WriteConflict { .. } => ErrorCode::WriteConflict,
            Self::SerializationFailure { .. } => ErrorCode::SerializationFailure,
            Self::TransactionNotFound(_) => ErrorCode::TransactionNotFound,
            Self::VersionNotFound(_) => ErrorCode::Internal,
        }
    }
}
