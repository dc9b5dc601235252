//! Fixed-size record header.
//!
//! Every record on disk is `header ++ payload`. The checksum leads the
//! header and covers every byte after it, payload included, so a record
//! torn anywhere past its first four bytes fails verification.
//!
//! ```text
//!  0        4        8                16               24               32   33   34      40
//!  +--------+--------+----------------+----------------+----------------+----+----+-------+
//!  | crc32  | length |      lsn       |    prev_lsn    |     txn_id     |type|flag| zero  |
//!  +--------+--------+----------------+----------------+----------------+----+----+-------+
//! ```

use bytes::{Buf, BufMut};
use txcore_common::constants::WAL_RECORD_HEADER_SIZE;
use txcore_common::types::{Lsn, TxnId};

use super::types::{RecordFlags, RecordType};
use crate::error::{WalError, WalResult};

const CHECKSUM_LEN: usize = 4;
const RESERVED_LEN: usize = 6;

/// Header preceding every WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// LSN of this record.
    pub lsn: Lsn,
    /// LSN of the previous record written by the same transaction, or
    /// `Lsn::INVALID` for its first record.
    pub prev_lsn: Lsn,
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Payload kind.
    pub record_type: RecordType,
    /// Record flags.
    pub flags: RecordFlags,
    /// Payload length in bytes.
    pub payload_length: u32,
    /// CRC32 over the header bytes after this field and the payload.
    pub checksum: u32,
}

impl RecordHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = WAL_RECORD_HEADER_SIZE;

    /// Creates a header with a zero checksum.
    pub fn new(
        lsn: Lsn,
        prev_lsn: Lsn,
        txn_id: TxnId,
        record_type: RecordType,
        flags: RecordFlags,
        payload_length: u32,
    ) -> Self {
        Self {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            flags,
            payload_length,
            checksum: 0,
        }
    }

    fn put_covered(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.payload_length);
        buf.put_u64_le(self.lsn.as_u64());
        buf.put_u64_le(self.prev_lsn.as_u64());
        buf.put_u64_le(self.txn_id.as_u64());
        buf.put_u8(self.record_type.as_u8());
        buf.put_u8(self.flags.bits());
        buf.put_bytes(0, RESERVED_LEN);
    }

    /// Writes the encoded header to `buf`.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.checksum);
        self.put_covered(buf);
    }

    /// Returns the encoded header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        self.serialize(&mut &mut out[..]);
        out
    }

    /// Reads a header from `buf`.
    ///
    /// Fails on a short buffer, an unknown record type or non-zero
    /// reserved bytes. The checksum is not verified here.
    pub fn deserialize(buf: &mut impl Buf) -> WalResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(WalError::deserialization_error(format!(
                "record header needs {} bytes, found {}",
                Self::SIZE,
                buf.remaining()
            )));
        }

        let checksum = buf.get_u32_le();
        let payload_length = buf.get_u32_le();
        let lsn = Lsn::new(buf.get_u64_le());
        let prev_lsn = Lsn::new(buf.get_u64_le());
        let txn_id = TxnId::new(buf.get_u64_le());
        let record_type = RecordType::from_u8(buf.get_u8())?;
        let flags = RecordFlags::from_bits_truncate(buf.get_u8());

        let mut reserved = [0u8; RESERVED_LEN];
        buf.copy_to_slice(&mut reserved);
        if reserved.iter().any(|b| *b != 0) {
            return Err(WalError::deserialization_error(format!(
                "record header at lsn {lsn} has non-zero reserved bytes"
            )));
        }

        Ok(Self {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            flags,
            payload_length,
            checksum,
        })
    }

    /// Reads a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        Self::deserialize(&mut &bytes[..])
    }

    /// Header plus payload length.
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.payload_length as usize
    }

    /// Computes the checksum this header should carry for `payload`.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut covered = [0u8; Self::SIZE - CHECKSUM_LEN];
        self.put_covered(&mut &mut covered[..]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&covered);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Stamps the checksum for `payload`.
    pub fn set_checksum(&mut self, payload: &[u8]) {
        self.checksum = self.compute_checksum(payload);
    }

    /// Checks the stored checksum against `payload`.
    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(record_type: RecordType, payload_length: u32) -> RecordHeader {
        RecordHeader::new(
            Lsn::new(1000),
            Lsn::new(500),
            TxnId::new(42),
            record_type,
            RecordFlags::REDO,
            payload_length,
        )
    }

    #[test]
    fn test_encoded_size_and_layout() {
        let mut h = header(RecordType::Insert, 3);
        h.set_checksum(b"abc");
        let bytes = h.to_bytes();

        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], &h.checksum.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &1000u64.to_le_bytes());
        assert_eq!(&bytes[34..], &[0u8; 6]);
        assert_eq!(RecordHeader::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn test_checksum_covers_header_and_payload() {
        let mut h = header(RecordType::Insert, 10);
        h.set_checksum(b"test data!");
        assert!(h.verify_checksum(b"test data!"));
        assert!(!h.verify_checksum(b"wrong data"));

        let mut moved = h;
        moved.prev_lsn = Lsn::new(499);
        assert!(!moved.verify_checksum(b"test data!"));
    }

    #[test]
    fn test_short_or_dirty_header_rejected() {
        assert!(RecordHeader::from_bytes(&[0u8; 12]).is_err());

        let mut bytes = header(RecordType::Commit, 0).to_bytes();
        bytes[39] = 0xFF;
        assert!(RecordHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_total_size() {
        assert_eq!(header(RecordType::Commit, 100).total_size(), 140);
    }
}
