//! WAL record types and flags.
//!
//! This module defines the record types and the main WalRecord enum.

use bytes::{Buf, Bytes, BytesMut};
use txcore_common::types::{Lsn, RowKey, TxnId};

use super::header::RecordHeader;
use super::payload::*;
use crate::error::{WalError, WalResult};

/// Record type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Insert a new row.
    Insert = 1,
    /// Update an existing row.
    Update = 2,
    /// Delete a row.
    Delete = 3,
    /// Transaction commit.
    Commit = 4,
    /// Transaction abort/rollback.
    Abort = 5,
    /// Compensation log record (partial rollback).
    Compensation = 9,
    /// Segment header (first record in each segment).
    SegmentHeader = 11,
}

impl RecordType {
    /// Converts the record type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record type from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::Insert),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            4 => Ok(Self::Commit),
            5 => Ok(Self::Abort),
            9 => Ok(Self::Compensation),
            11 => Ok(Self::SegmentHeader),
            _ => Err(WalError::deserialization_error(format!(
                "Unknown record type: {}",
                value
            ))),
        }
    }

    /// Returns true if this record changes row data.
    pub const fn is_data_record(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Returns true if this record ends a transaction.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Commit | Self::Abort)
    }
}

bitflags::bitflags! {
    /// Flags for WAL records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u8 {
        /// Record contains redo information.
        const REDO = 0b0000_0001;
        /// Record is a compensation log record (CLR).
        const CLR = 0b0000_0100;
    }
}

/// A complete WAL record with header and typed payload.
#[derive(Debug, Clone)]
pub struct WalRecord {
    /// Record header.
    pub header: RecordHeader,
    /// Record payload.
    pub payload: WalPayload,
}

/// WAL record payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalPayload {
    /// Insert record payload.
    Insert(InsertPayload),
    /// Update record payload.
    Update(UpdatePayload),
    /// Delete record payload.
    Delete(DeletePayload),
    /// Commit record payload.
    Commit(CommitPayload),
    /// Abort record (no payload).
    Abort,
    /// Compensation log record payload.
    Compensation(CompensationPayload),
    /// Segment header.
    SegmentHeader(SegmentHeaderPayload),
}

impl WalPayload {
    /// Returns the record type this payload is written as.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Insert(_) => RecordType::Insert,
            Self::Update(_) => RecordType::Update,
            Self::Delete(_) => RecordType::Delete,
            Self::Commit(_) => RecordType::Commit,
            Self::Abort => RecordType::Abort,
            Self::Compensation(_) => RecordType::Compensation,
            Self::SegmentHeader(_) => RecordType::SegmentHeader,
        }
    }

    /// Returns the header flags for this payload.
    pub fn flags(&self) -> RecordFlags {
        match self {
            Self::Insert(_) | Self::Update(_) | Self::Delete(_) | Self::Commit(_) => {
                RecordFlags::REDO
            }
            Self::Compensation(_) => RecordFlags::CLR,
            Self::Abort | Self::SegmentHeader(_) => RecordFlags::empty(),
        }
    }

    /// Returns the row a data payload touches.
    pub fn key(&self) -> Option<RowKey> {
        match self {
            Self::Insert(p) => Some(p.key),
            Self::Update(p) => Some(p.key),
            Self::Delete(p) => Some(p.key),
            _ => None,
        }
    }

    /// Serializes just the payload.
    pub fn serialize(&self) -> WalResult<Bytes> {
        match self {
            Self::Insert(p) => p.serialize(),
            Self::Update(p) => p.serialize(),
            Self::Delete(p) => p.serialize(),
            Self::Commit(p) => p.serialize(),
            Self::Abort => Ok(Bytes::new()),
            Self::Compensation(p) => p.serialize(),
            Self::SegmentHeader(p) => p.serialize(),
        }
    }

    /// Deserializes the payload based on record type.
    pub fn deserialize(record_type: RecordType, bytes: &[u8]) -> WalResult<Self> {
        match record_type {
            RecordType::Insert => Ok(Self::Insert(InsertPayload::deserialize(bytes)?)),
            RecordType::Update => Ok(Self::Update(UpdatePayload::deserialize(bytes)?)),
            RecordType::Delete => Ok(Self::Delete(DeletePayload::deserialize(bytes)?)),
            RecordType::Commit => Ok(Self::Commit(CommitPayload::deserialize(bytes)?)),
            RecordType::Abort => Ok(Self::Abort),
            RecordType::Compensation => Ok(Self::Compensation(
                CompensationPayload::deserialize(bytes)?,
            )),
            RecordType::SegmentHeader => Ok(Self::SegmentHeader(
                SegmentHeaderPayload::deserialize(bytes)?,
            )),
        }
    }
}

impl WalRecord {
    /// Creates a record for `payload`.
    pub fn new(lsn: Lsn, prev_lsn: Lsn, txn_id: TxnId, payload: WalPayload) -> Self {
        let header = RecordHeader::new(
            lsn,
            prev_lsn,
            txn_id,
            payload.record_type(),
            payload.flags(),
            0,
        );
        Self { header, payload }
    }

    /// Returns the LSN of this record.
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    /// Returns the transaction ID of this record.
    pub fn txn_id(&self) -> TxnId {
        self.header.txn_id
    }

    /// Returns the record type.
    pub fn record_type(&self) -> RecordType {
        self.header.record_type
    }

    /// Serializes the entire record (header + payload) to bytes, filling in
    /// the payload length and checksum.
    pub fn serialize(&self) -> WalResult<Bytes> {
        let payload_bytes = self.payload.serialize()?;
        let mut header = self.header;
        header.payload_length = payload_bytes.len() as u32;
        header.set_checksum(&payload_bytes);

        let total_size = RecordHeader::SIZE + payload_bytes.len();
        let mut buf = BytesMut::with_capacity(total_size);
        header.serialize(&mut buf);
        buf.extend_from_slice(&payload_bytes);

        Ok(buf.freeze())
    }

    /// Deserializes a record from bytes, verifying its checksum.
    pub fn deserialize(mut buf: impl Buf) -> WalResult<Self> {
        let header = RecordHeader::deserialize(&mut buf)?;

        if buf.remaining() < header.payload_length as usize {
            return Err(WalError::deserialization_error(format!(
                "Not enough bytes for payload: {} < {}",
                buf.remaining(),
                header.payload_length
            )));
        }

        let payload_bytes = buf.copy_to_bytes(header.payload_length as usize);
        Self::from_parts(header, &payload_bytes, true)
    }

    /// Builds a record from an already decoded header and its payload bytes.
    pub fn from_parts(header: RecordHeader, payload: &[u8], verify: bool) -> WalResult<Self> {
        if verify && !header.verify_checksum(payload) {
            return Err(WalError::checksum_mismatch(
                header.lsn,
                header.checksum,
                header.compute_checksum(payload),
            ));
        }
        let payload = WalPayload::deserialize(header.record_type, payload)?;

        Ok(Self { header, payload })
    }
}
