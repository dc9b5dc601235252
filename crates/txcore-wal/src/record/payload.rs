//! WAL record payloads.
//!
//! Row keys are written as their 16-byte little-endian encoding; every other
//! integer uses the big-endian order of [`BufMut::put_u64`] and friends.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use txcore_common::constants::{WAL_FORMAT_VERSION, WAL_MAGIC};
use txcore_common::types::{Lsn, RowKey, Timestamp};

use crate::error::{WalError, WalResult};

/// Trait for serializable payloads.
pub trait Payload: Sized {
    /// Serializes the payload to bytes.
    fn serialize(&self) -> WalResult<Bytes>;
    /// Deserializes the payload from bytes.
    fn deserialize(bytes: &[u8]) -> WalResult<Self>;
}

fn put_key(buf: &mut BytesMut, key: RowKey) {
    buf.put_slice(&key.to_le_bytes());
}

fn get_key(buf: &mut &[u8], what: &str) -> WalResult<RowKey> {
    if buf.remaining() < RowKey::ENCODED_SIZE {
        return Err(WalError::deserialization_error(format!(
            "{what} key truncated"
        )));
    }
    let mut raw = [0u8; RowKey::ENCODED_SIZE];
    buf.copy_to_slice(&mut raw);
    Ok(RowKey::from_le_bytes(raw))
}

fn get_value(buf: &mut &[u8], what: &str) -> WalResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(WalError::deserialization_error(format!(
            "{what} value length missing"
        )));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WalError::deserialization_error(format!(
            "{what} value truncated"
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Insert of a row that had no visible version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPayload {
    /// Row that was inserted.
    pub key: RowKey,
    /// New row image.
    pub value: Bytes,
}

impl Payload for InsertPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(RowKey::ENCODED_SIZE + 4 + self.value.len());
        put_key(&mut buf, self.key);
        buf.put_u32(self.value.len() as u32);
        buf.extend_from_slice(&self.value);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        let key = get_key(&mut buf, "InsertPayload")?;
        let value = get_value(&mut buf, "InsertPayload")?;
        Ok(Self { key, value })
    }
}

/// Replacement of an existing row image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePayload {
    /// Row that was updated.
    pub key: RowKey,
    /// New row image (redo only; undo lives in the version chain).
    pub value: Bytes,
}

impl Payload for UpdatePayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(RowKey::ENCODED_SIZE + 4 + self.value.len());
        put_key(&mut buf, self.key);
        buf.put_u32(self.value.len() as u32);
        buf.extend_from_slice(&self.value);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        let key = get_key(&mut buf, "UpdatePayload")?;
        let value = get_value(&mut buf, "UpdatePayload")?;
        Ok(Self { key, value })
    }
}

/// Deletion of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    /// Row that was deleted.
    pub key: RowKey,
}

impl Payload for DeletePayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(RowKey::ENCODED_SIZE);
        put_key(&mut buf, self.key);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        let key = get_key(&mut buf, "DeletePayload")?;
        Ok(Self { key })
    }
}

/// Commit record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPayload {
    /// Commit timestamp the transaction will publish with.
    pub commit_timestamp: Timestamp,
}

impl Payload for CommitPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.commit_timestamp.as_u64());
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 8 {
            return Err(WalError::deserialization_error("CommitPayload too short"));
        }
        let mut buf = bytes;
        Ok(Self {
            commit_timestamp: Timestamp::new(buf.get_u64()),
        })
    }
}

/// Compensation record written by a partial rollback.
///
/// Replay discards every earlier data record of the same transaction whose
/// LSN is greater than `undo_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationPayload {
    /// Last LSN that survives the rollback ([`Lsn::INVALID`] drops all).
    pub undo_to: Lsn,
}

impl Payload for CompensationPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.undo_to.as_u64());
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 8 {
            return Err(WalError::deserialization_error(
                "CompensationPayload too short",
            ));
        }
        let mut buf = bytes;
        Ok(Self {
            undo_to: Lsn::new(buf.get_u64()),
        })
    }
}

/// Segment header payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeaderPayload {
    /// Magic number for validation.
    pub magic: u32,
    /// WAL format version.
    pub version: u32,
    /// Segment ID.
    pub segment_id: u64,
    /// First LSN in this segment.
    pub first_lsn: Lsn,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
}

impl SegmentHeaderPayload {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    /// Creates a new segment header.
    pub fn new(segment_id: u64, first_lsn: Lsn) -> Self {
        Self {
            magic: WAL_MAGIC,
            version: u32::from(WAL_FORMAT_VERSION),
            segment_id,
            first_lsn,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Validates the segment header.
    pub fn validate(&self) -> WalResult<()> {
        if self.magic != WAL_MAGIC {
            return Err(WalError::InvalidMagic {
                expected: WAL_MAGIC,
                found: self.magic,
            });
        }
        if self.version != u32::from(WAL_FORMAT_VERSION) {
            return Err(WalError::UnsupportedVersion {
                expected: u32::from(WAL_FORMAT_VERSION),
                found: self.version,
            });
        }
        Ok(())
    }
}

impl Payload for SegmentHeaderPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.magic);
        buf.put_u32(self.version);
        buf.put_u64(self.segment_id);
        buf.put_u64(self.first_lsn.as_u64());
        buf.put_u64(self.created_at);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(WalError::deserialization_error(
                "SegmentHeaderPayload too short",
            ));
        }
        let mut buf = bytes;
        Ok(Self {
            magic: buf.get_u32(),
            version: buf.get_u32(),
            segment_id: buf.get_u64(),
            first_lsn: Lsn::new(buf.get_u64()),
            created_at: buf.get_u64(),
        })
    }
}
