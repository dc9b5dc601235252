//! Stable error codes and the configuration error type.

use std::fmt;
use thiserror::Error;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Operation was cancelled.
    Cancelled = 0x0005,
    /// Configuration rejected.
    InvalidConfig = 0x0006,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0104,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction was aborted.
    TransactionAborted = 0x0300,
    /// Serialization failure at commit.
    SerializationFailure = 0x0301,
    /// Transaction was chosen as a deadlock victim.
    DeadlockVictim = 0x0302,
    /// Lock wait timed out.
    LockTimeout = 0x0303,
    /// Transaction not found.
    TransactionNotFound = 0x0304,
    /// Operation not allowed in the current transaction state.
    InvalidTransactionState = 0x0305,
    /// Too many live transactions.
    TooManyActiveTransactions = 0x0306,
    /// Concurrent uncommitted write on the same row.
    WriteConflict = 0x0307,
    /// Unknown savepoint name.
    SavepointNotFound = 0x0308,

    // WAL errors (0x0400 - 0x04FF)
    /// WAL is corrupted.
    WalCorrupted = 0x0400,
    /// WAL write or sync failed.
    WalWriteFailed = 0x0401,
    /// WAL record exceeds the size limit.
    WalRecordTooLarge = 0x0402,
    /// WAL has been closed.
    WalClosed = 0x0404,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x03 => "Transaction",
            0x04 => "WAL",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }

    /// Returns the error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidConfig
    }
}
