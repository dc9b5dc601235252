//! Log errors.
//!
//! Corruption variants are only produced while reading; the append and
//! flush paths fail with `Io`, `FlushFailed`, `RecordTooLarge` or `Closed`.

use std::io;
use thiserror::Error;

use txcore_common::types::Lsn;
use txcore_common::ErrorCode;

/// Result alias for log operations.
pub type WalResult<T> = Result<T, WalError>;

/// Log error.
#[derive(Debug, Error)]
pub enum WalError {
    /// Filesystem error outside a flush batch.
    #[error("wal i/o: {source}")]
    Io {
        /// Underlying error.
        #[from]
        source: io::Error,
    },

    /// A segment that cannot be read past its header.
    #[error("wal segment {segment_id:016x} is corrupt: {reason}")]
    SegmentCorrupted {
        /// Segment that failed validation.
        segment_id: u64,
        /// What was wrong.
        reason: String,
    },

    /// The segment header does not start with the log magic.
    #[error("not a wal segment: magic {found:#010x}, expected {expected:#010x}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Magic found on disk.
        found: u32,
    },

    /// Segment written by a newer format.
    #[error("wal format version {found} is not supported (this build reads {expected})")]
    UnsupportedVersion {
        /// Supported version.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },

    /// Stored and recomputed CRC differ.
    #[error("crc mismatch at lsn {lsn}: stored {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// LSN from the damaged header.
        lsn: Lsn,
        /// Stored checksum.
        expected: u32,
        /// Checksum of the bytes read.
        computed: u32,
    },

    /// Encoded record exceeds `max_record_size`.
    #[error("wal record of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge {
        /// Encoded record size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Append or flush after `close`.
    #[error("wal is closed")]
    Closed,

    /// A flush batch failed. Every waiter covered by the batch receives a
    /// copy, and the log refuses further writes until it is reopened.
    #[error("wal flush up to lsn {upto} failed: {message}")]
    FlushFailed {
        /// Highest LSN the failed batch tried to make durable.
        upto: Lsn,
        /// Kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// Message of the underlying I/O error.
        message: String,
    },

    /// Bytes that do not decode as a record.
    #[error("undecodable wal record: {reason}")]
    DeserializationError {
        /// What could not be decoded.
        reason: String,
    },

    /// Rejected `WalConfig`.
    #[error("invalid wal config: {reason}")]
    ConfigError {
        /// Rejected setting.
        reason: String,
    },
}

impl WalError {
    pub fn segment_corrupted(segment_id: u64, reason: impl Into<String>) -> Self {
        Self::SegmentCorrupted {
            segment_id,
            reason: reason.into(),
        }
    }

    pub fn checksum_mismatch(lsn: Lsn, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            lsn,
            expected,
            computed,
        }
    }

    pub fn record_too_large(size: usize, max: usize) -> Self {
        Self::RecordTooLarge { size, max }
    }

    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::DeserializationError {
            reason: reason.into(),
        }
    }

    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Creates a flush failure from the I/O error that caused it.
    pub fn flush_failed(upto: Lsn, err: &io::Error) -> Self {
        Self::FlushFailed {
            upto,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Returns a copy of a flush failure, for handing to another waiter.
    pub(crate) fn duplicate_flush_failure(&self) -> Option<Self> {
        match self {
            Self::FlushFailed {
                upto,
                kind,
                message,
            } => Some(Self::FlushFailed {
                upto: *upto,
                kind: *kind,
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// True for errors that mean the bytes on disk are damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SegmentCorrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::DeserializationError { .. }
        )
    }

    /// Stable code reported to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::Io,
            Self::FlushFailed { .. } => ErrorCode::WalWriteFailed,
            Self::RecordTooLarge { .. } => ErrorCode::WalRecordTooLarge,
            Self::Closed => ErrorCode::WalClosed,
            Self::ConfigError { .. } => ErrorCode::InvalidConfig,
            _ => ErrorCode::WalCorrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = WalError::segment_corrupted(3, "bad data");
        assert!(err.is_corruption());
        assert_eq!(err.code(), ErrorCode::WalCorrupted);

        let err = WalError::checksum_mismatch(Lsn::new(100), 0x1234, 0x5678);
        assert!(err.is_corruption());

        assert!(!WalError::Closed.is_corruption());
        assert_eq!(WalError::Closed.code(), ErrorCode::WalClosed);
    }

    #[test]
    fn test_error_display() {
        let err = WalError::record_too_large(100_000_000, 10_000_000);
        assert_eq!(
            err.to_string(),
            "wal record of 100000000 bytes exceeds the 10000000 byte limit"
        );
        assert_eq!(
            WalError::segment_corrupted(0x2a, "short header").to_string(),
            "wal segment 000000000000002a is corrupt: short header"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let wal_err: WalError = io_err.into();
        assert!(matches!(wal_err, WalError::Io { .. }));
        assert_eq!(wal_err.code(), ErrorCode::Io);
    }

    #[test]
    fn test_flush_failure_is_duplicated() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk gone");
        let err = WalError::flush_failed(Lsn::new(9), &io_err);
        assert_eq!(err.code(), ErrorCode::WalWriteFailed);

        let copy = err.duplicate_flush_failure().unwrap();
        assert_eq!(copy.to_string(), err.to_string());
        assert!(WalError::Closed.duplicate_flush_failure().is_none());
    }
}
