//! WAL segment management.
//!
//! This module handles individual WAL segment files. A segment is created
//! with a segment header record and then only ever appended to; the writer
//! owns the active segment exclusively.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use txcore_common::types::{Lsn, TxnId};

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::record::payload::SegmentHeaderPayload;
use crate::record::types::{WalPayload, WalRecord};

/// Segment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Segment is open for writing.
    Active,
    /// Segment is sealed (no more writes).
    Sealed,
}

/// A segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    /// Segment id.
    pub segment_id: u64,
    /// File name within the WAL directory.
    pub file_name: String,
    /// Bytes in the file. Records still buffered are not counted.
    pub size_bytes: u64,
    /// True for the segment currently written.
    pub active: bool,
}

/// Result of a forced segment switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentSwitch {
    /// Segment sealed by the switch, if one was open.
    pub previous: Option<u64>,
    /// Segment that now receives records.
    pub current: u64,
    /// LSN the next record will get.
    pub first_lsn: Lsn,
}

/// Lists the segment files in `config.dir` in id order. `active` marks
/// the segment currently written.
pub fn list_segments(config: &WalConfig, active: Option<u64>) -> WalResult<Vec<SegmentInfo>> {
    let mut out = Vec::new();
    if !config.dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(&config.dir)? {
        let entry = entry?;
        let Some(segment_id) = WalConfig::parse_segment_id(&entry.path()) else {
            continue;
        };
        out.push(SegmentInfo {
            segment_id,
            file_name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: entry.metadata()?.len(),
            active: active == Some(segment_id),
        });
    }
    out.sort_by_key(|s| s.segment_id);
    Ok(out)
}

/// A single WAL segment file.
pub struct WalSegment {
    segment_id: u64,
    path: PathBuf,
    file: Arc<File>,
    write_pos: u64,
    size_limit: usize,
    first_lsn: Lsn,
    state: SegmentState,
}

impl WalSegment {
    /// Creates a new segment file whose first data record will carry
    /// `first_lsn`.
    pub fn create(segment_id: u64, config: &WalConfig, first_lsn: Lsn) -> WalResult<Self> {
        let path = config.segment_path(segment_id);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            segment_id,
            path,
            file: Arc::new(file),
            write_pos: 0,
            size_limit: config.segment_size,
            first_lsn,
            state: SegmentState::Active,
        };
        segment.write_header()?;

        Ok(segment)
    }

    /// Writes the segment header record. It does not consume an LSN.
    fn write_header(&mut self) -> WalResult<()> {
        let record = WalRecord::new(
            Lsn::INVALID,
            Lsn::INVALID,
            TxnId::INVALID,
            WalPayload::SegmentHeader(SegmentHeaderPayload::new(
                self.segment_id,
                self.first_lsn,
            )),
        );
        let bytes = record.serialize()?;
        self.write_at_end(&bytes)
    }

    fn write_at_end(&mut self, bytes: &[u8]) -> WalResult<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(self.write_pos))?;
        file.write_all(bytes)?;
        self.write_pos += bytes.len() as u64;
        Ok(())
    }

    /// Returns the segment ID.
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Returns the first LSN in this segment.
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// Returns the current write position.
    pub fn write_position(&self) -> u64 {
        self.write_pos
    }

    /// Returns the remaining space in this segment.
    pub fn remaining_space(&self) -> usize {
        self.size_limit.saturating_sub(self.write_pos as usize)
    }

    /// Returns true if the segment has space for `len` more bytes.
    pub fn has_space_for(&self, len: usize) -> bool {
        self.remaining_space() >= len
    }

    /// Returns true if this segment is active (accepting writes).
    pub fn is_active(&self) -> bool {
        self.state == SegmentState::Active
    }

    /// Returns the segment state.
    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Seals the segment, preventing further writes.
    pub fn seal(&mut self) {
        self.state = SegmentState::Sealed;
    }

    /// Appends already serialized records to the segment.
    ///
    /// The caller checks [`has_space_for`](Self::has_space_for) first; a
    /// segment may exceed its limit only by a single oversized batch.
    pub fn append(&mut self, bytes: &[u8]) -> WalResult<()> {
        if !self.is_active() {
            return Err(WalError::segment_corrupted(
                self.segment_id,
                "append to a sealed segment",
            ));
        }
        self.write_at_end(bytes)
    }

    /// Syncs the segment data to disk.
    pub fn sync(&self) -> WalResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Returns a handle that can sync this segment without holding the
    /// writer lock.
    pub fn sync_handle(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Returns the path to this segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for WalSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalSegment")
            .field("segment_id", &self.segment_id)
            .field("path", &self.path)
            .field("first_lsn", &self.first_lsn)
            .field("write_pos", &self.write_pos)
            .field("state", &self.state)
            .finish()
    }
}
