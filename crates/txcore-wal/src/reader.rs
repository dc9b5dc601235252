//! WAL reader for recovery.
//!
//! This module provides the reader component for:
//! - Discovering segment files in the WAL directory
//! - Iterating over records in LSN order
//! - Validating segment headers and record checksums
//!
//! A record that cannot be read back in the *last* segment is a torn tail
//! left by a crash mid-write: iteration stops there and the position is
//! reported through [`RecordIterator::torn_tail`]. The same damage in an
//! earlier segment is corruption and is returned as an error.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::record::header::RecordHeader;
use crate::record::types::{RecordType, WalPayload, WalRecord};

/// Location of an unreadable tail in the last segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    /// Segment holding the tail.
    pub segment_id: u64,
    /// Segment file.
    pub path: PathBuf,
    /// Offset of the first unreadable byte; everything before it is valid.
    pub offset: u64,
    /// Why the record could not be read.
    pub reason: String,
}

impl TornTail {
    /// Cuts the segment back to its last valid record. A segment with no
    /// valid header is removed.
    pub fn repair(&self) -> WalResult<()> {
        if self.offset == 0 {
            std::fs::remove_file(&self.path)?;
        } else {
            let file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(self.offset)?;
            file.sync_all()?;
        }
        Ok(())
    }
}

/// WAL reader for recovery operations.
#[derive(Debug)]
pub struct WalReader {
    config: WalConfig,
    segments: Vec<(u64, PathBuf)>,
}

impl WalReader {
    /// Opens the WAL directory and lists its segments in id order.
    pub fn open(config: &WalConfig) -> WalResult<Self> {
        let mut segments = Vec::new();
        if config.dir.exists() {
            for entry in std::fs::read_dir(&config.dir)? {
                let path = entry?.path();
                if let Some(segment_id) = WalConfig::parse_segment_id(&path) {
                    segments.push((segment_id, path));
                }
            }
        }
        segments.sort_by_key(|(id, _)| *id);

        Ok(Self {
            config: config.clone(),
            segments,
        })
    }

    /// Returns the ids of the segments found, in order.
    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.iter().map(|(id, _)| *id).collect()
    }

    /// Returns the number of segments found.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns an iterator over all data and control records.
    ///
    /// Segment header records are validated but not yielded.
    pub fn records(&self) -> RecordIterator<'_> {
        RecordIterator {
            reader: self,
            segment_idx: 0,
            cursor: None,
            torn: None,
            done: false,
        }
    }
}

struct SegmentCursor {
    segment_id: u64,
    path: PathBuf,
    input: BufReader<File>,
    offset: u64,
    len: u64,
    is_last: bool,
}

/// Why a read stopped before the end of a segment.
enum ReadStop {
    Damaged(String),
    Failed(WalError),
}

impl From<WalError> for ReadStop {
    fn from(err: WalError) -> Self {
        Self::Failed(err)
    }
}

impl SegmentCursor {
    fn open(segment_id: u64, path: PathBuf, is_last: bool) -> WalResult<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            segment_id,
            path,
            input: BufReader::new(file),
            offset: 0,
            len,
            is_last,
        })
    }

    /// Reads the next record, or `None` at a clean end of segment.
    fn next_record(&mut self, verify: bool) -> Result<Option<WalRecord>, ReadStop> {
        if self.offset == self.len {
            return Ok(None);
        }
        if self.offset + RecordHeader::SIZE as u64 > self.len {
            return Err(ReadStop::Damaged("partial record header".into()));
        }

        let mut header_buf = [0u8; RecordHeader::SIZE];
        self.input
            .read_exact(&mut header_buf)
            .map_err(WalError::from)?;
        let header = RecordHeader::from_bytes(&header_buf)
            .map_err(|e| ReadStop::Damaged(e.to_string()))?;

        if self.offset + header.total_size() as u64 > self.len {
            return Err(ReadStop::Damaged(format!(
                "record at LSN {} extends past end of file",
                header.lsn
            )));
        }

        let mut payload = vec![0u8; header.payload_length as usize];
        self.input.read_exact(&mut payload).map_err(WalError::from)?;
        let record = WalRecord::from_parts(header, &payload, verify)
            .map_err(|e| ReadStop::Damaged(e.to_string()))?;

        self.offset += header.total_size() as u64;
        Ok(Some(record))
    }

    fn check_segment_header(&self, record: &WalRecord) -> WalResult<()> {
        match &record.payload {
            WalPayload::SegmentHeader(header) => {
                header.validate()?;
                if header.segment_id != self.segment_id {
                    return Err(WalError::segment_corrupted(
                        self.segment_id,
                        format!("header names segment {}", header.segment_id),
                    ));
                }
                Ok(())
            }
            _ => Err(WalError::segment_corrupted(
                self.segment_id,
                "first record is not a segment header",
            )),
        }
    }
}

/// Iterator over WAL records.
pub struct RecordIterator<'a> {
    reader: &'a WalReader,
    segment_idx: usize,
    cursor: Option<SegmentCursor>,
    torn: Option<TornTail>,
    done: bool,
}

impl RecordIterator<'_> {
    /// Returns the torn tail found, once iteration has reached it.
    pub fn torn_tail(&self) -> Option<&TornTail> {
        self.torn.as_ref()
    }

    /// Consumes the iterator and returns the torn tail, if any.
    pub fn into_torn_tail(self) -> Option<TornTail> {
        self.torn
    }

    fn advance(&mut self) -> WalResult<Option<WalRecord>> {
        loop {
            if self.cursor.is_none() {
                let Some((segment_id, path)) = self.reader.segments.get(self.segment_idx) else {
                    return Ok(None);
                };
                let is_last = self.segment_idx + 1 == self.reader.segments.len();
                self.cursor = Some(SegmentCursor::open(*segment_id, path.clone(), is_last)?);
            }

            let verify = self.reader.config.verify_checksums;
            let Some(cursor) = self.cursor.as_mut() else {
                continue;
            };
            let at_start = cursor.offset == 0;

            match cursor.next_record(verify) {
                Ok(Some(record)) if at_start => {
                    cursor.check_segment_header(&record)?;
                }
                Ok(Some(record)) if record.record_type() == RecordType::SegmentHeader => {
                    return Err(WalError::segment_corrupted(
                        cursor.segment_id,
                        format!("segment header at offset {}", cursor.offset),
                    ));
                }
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) if at_start && !cursor.is_last => {
                    return Err(WalError::segment_corrupted(
                        cursor.segment_id,
                        "empty segment",
                    ));
                }
                Ok(None) if !at_start => {
                    self.cursor = None;
                    self.segment_idx += 1;
                }
                Ok(None) => {
                    self.torn = Some(TornTail {
                        segment_id: cursor.segment_id,
                        path: cursor.path.clone(),
                        offset: 0,
                        reason: "empty segment".into(),
                    });
                    return Ok(None);
                }
                Err(ReadStop::Damaged(reason)) if cursor.is_last => {
                    tracing::warn!(
                        segment_id = cursor.segment_id,
                        offset = cursor.offset,
                        reason = %reason,
                        "WAL ends with a torn record"
                    );
                    self.torn = Some(TornTail {
                        segment_id: cursor.segment_id,
                        path: cursor.path.clone(),
                        offset: cursor.offset,
                        reason,
                    });
                    return Ok(None);
                }
                Err(ReadStop::Damaged(reason)) => {
                    return Err(WalError::segment_corrupted(
                        cursor.segment_id,
                        format!("at offset {}: {}", cursor.offset, reason),
                    ));
                }
                Err(ReadStop::Failed(err)) => return Err(err),
            }
        }
    }
}

impl Iterator for RecordIterator<'_> {
    type Item = WalResult<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CommitPayload, InsertPayload};
    use crate::writer::WalWriter;
    use bytes::Bytes;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;
    use txcore_common::types::{Lsn, RowKey, TableId, Timestamp, TxnId};

    fn test_config(dir: &std::path::Path) -> WalConfig {
        WalConfig::new(dir)
            .with_segment_size(1024 * 1024)
            .with_max_record_size(256 * 1024)
    }

    fn write_records(config: &WalConfig, count: u64, value_len: usize) {
        let writer = WalWriter::new(Arc::new(config.clone()), Lsn::FIRST, 0);
        for i in 1..=count {
            writer
                .append(
                    TxnId::new(i),
                    WalPayload::Insert(InsertPayload {
                        key: RowKey::new(TableId::new(1), i),
                        value: Bytes::from(vec![b'v'; value_len]),
                    }),
                )
                .unwrap();
            writer
                .append(
                    TxnId::new(i),
                    WalPayload::Commit(CommitPayload {
                        commit_timestamp: Timestamp::new(i),
                    }),
                )
                .unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_empty_directory() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp.path().join("missing"));
        let reader = WalReader::open(&config).unwrap();
        assert_eq!(reader.segment_count(), 0);
        assert_eq!(reader.records().count(), 0);
    }

    #[test]
    fn test_reads_back_in_lsn_order() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        write_records(&config, 5, 16);

        let reader = WalReader::open(&config).unwrap();
        let records: Vec<_> = reader.records().collect::<WalResult<_>>().unwrap();

        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.lsn(), Lsn::new(i as u64 + 1));
        }
    }

    #[test]
    fn test_reads_across_segments() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        write_records(&config, 12, 200 * 1024);

        let reader = WalReader::open(&config).unwrap();
        assert!(reader.segment_count() > 1);
        let records: Vec<_> = reader.records().collect::<WalResult<_>>().unwrap();
        assert_eq!(records.len(), 24);
    }

    #[test]
    fn test_torn_tail_stops_iteration() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        write_records(&config, 3, 16);

        let path = config.segment_path(0);
        let valid_len = std::fs::metadata(&path).unwrap().len();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x42; 25]).unwrap();
        drop(file);

        let reader = WalReader::open(&config).unwrap();
        let mut iter = reader.records();
        let records: Vec<_> = iter.by_ref().collect::<WalResult<_>>().unwrap();
        assert_eq!(records.len(), 6);

        let torn = iter.into_torn_tail().unwrap();
        assert_eq!(torn.offset, valid_len);

        torn.repair().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
        let reader = WalReader::open(&config).unwrap();
        let mut iter = reader.records();
        assert_eq!(iter.by_ref().count(), 6);
        assert!(iter.torn_tail().is_none());
    }

    #[test]
    fn test_flipped_byte_in_last_record_is_torn() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        write_records(&config, 2, 16);

        let path = config.segment_path(0);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let reader = WalReader::open(&config).unwrap();
        let mut iter = reader.records();
        let records: Vec<_> = iter.by_ref().collect::<WalResult<_>>().unwrap();
        assert_eq!(records.len(), 3);
        assert!(iter.torn_tail().is_some());
    }

    #[test]
    fn test_damage_in_earlier_segment_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        write_records(&config, 12, 200 * 1024);

        let path = config.segment_path(0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[200] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let reader = WalReader::open(&config).unwrap();
        let err = reader
            .records()
            .collect::<WalResult<Vec<_>>>()
            .unwrap_err();
        assert!(err.is_corruption());
    }
}
