//! WAL writer for appending records.
//!
//! This module provides the writer component that handles:
//! - Assigning LSNs in append order
//! - Buffering serialized records and spilling them to the active segment
//! - Segment rotation
//!
//! Durability is not decided here: the group commit manager asks the writer
//! to write out its buffer and then syncs the returned handle.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use txcore_common::types::{Lsn, TxnId};

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::record::types::{WalPayload, WalRecord};
use crate::segment::{SegmentSwitch, WalSegment};

/// WAL writer statistics.
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Total bytes appended.
    pub bytes_written: AtomicU64,
    /// Total records appended.
    pub records_written: AtomicU64,
    /// Number of segment rotations.
    pub segment_rotations: AtomicU64,
    /// Number of buffer spills to the segment file.
    pub buffer_writes: AtomicU64,
}

struct WriterState {
    segment: Option<WalSegment>,
    next_segment_id: u64,
    next_lsn: Lsn,
    buffer: BytesMut,
    txn_last_lsn: HashMap<TxnId, Lsn>,
}

/// WAL writer for appending records.
pub struct WalWriter {
    config: Arc<WalConfig>,
    state: Mutex<WriterState>,
    /// Last LSN handed out.
    last_lsn: AtomicU64,
    /// Last LSN written to a segment file.
    written_lsn: AtomicU64,
    /// Last LSN known to be on stable storage.
    durable_lsn: AtomicU64,
    /// Set by the first failed flush; later operations fail with a copy.
    failure: Mutex<Option<WalError>>,
    stats: WriterStats,
    closed: AtomicBool,
}

impl WalWriter {
    /// Creates a writer that continues at `next_lsn`, creating segments
    /// from `next_segment_id` on.
    pub fn new(config: Arc<WalConfig>, next_lsn: Lsn, next_segment_id: u64) -> Self {
        let next_lsn = if next_lsn.is_valid() {
            next_lsn
        } else {
            Lsn::FIRST
        };
        let last = next_lsn.as_u64() - 1;
        let buffer = BytesMut::with_capacity(config.write_buffer_size);
        Self {
            config,
            state: Mutex::new(WriterState {
                segment: None,
                next_segment_id,
                next_lsn,
                buffer,
                txn_last_lsn: HashMap::new(),
            }),
            last_lsn: AtomicU64::new(last),
            written_lsn: AtomicU64::new(last),
            durable_lsn: AtomicU64::new(last),
            failure: Mutex::new(None),
            stats: WriterStats::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        Lsn::new(self.last_lsn().as_u64() + 1)
    }

    /// Returns the last LSN handed out.
    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.last_lsn.load(Ordering::Acquire))
    }

    /// Returns the last LSN written to a segment file.
    pub fn written_lsn(&self) -> Lsn {
        Lsn::new(self.written_lsn.load(Ordering::Acquire))
    }

    /// Returns the last LSN known to be durable.
    pub fn durable_lsn(&self) -> Lsn {
        Lsn::new(self.durable_lsn.load(Ordering::Acquire))
    }

    /// Records that everything up to `lsn` is durable.
    pub fn mark_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    /// Returns the id of the segment currently written, if any.
    pub fn active_segment_id(&self) -> Option<u64> {
        self.state.lock().segment.as_ref().map(WalSegment::segment_id)
    }

    /// Appends a record for `txn_id`, chaining it to the transaction's
    /// previous record.
    ///
    /// Returns the LSN assigned to the record. A commit or abort record
    /// ends the transaction's chain.
    pub fn append(&self, txn_id: TxnId, payload: WalPayload) -> WalResult<Lsn> {
        self.check_usable()?;

        let terminal = payload.record_type().is_terminal();
        let mut state = self.state.lock();

        let lsn = state.next_lsn;
        let prev_lsn = state
            .txn_last_lsn
            .get(&txn_id)
            .copied()
            .unwrap_or(Lsn::INVALID);
        let bytes = WalRecord::new(lsn, prev_lsn, txn_id, payload).serialize()?;

        if bytes.len() > self.config.max_record_size {
            return Err(WalError::record_too_large(
                bytes.len(),
                self.config.max_record_size,
            ));
        }

        if let Err(err) = self.ensure_segment_space(&mut state, bytes.len(), lsn) {
            return Err(self.fail(&mut state, err));
        }

        state.buffer.extend_from_slice(&bytes);
        state.next_lsn = lsn.next();
        self.last_lsn.store(lsn.as_u64(), Ordering::Release);
        if terminal {
            state.txn_last_lsn.remove(&txn_id);
        } else {
            state.txn_last_lsn.insert(txn_id, lsn);
        }

        self.stats
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.stats.records_written.fetch_add(1, Ordering::Relaxed);

        if state.buffer.len() >= self.config.write_buffer_size {
            if let Err(err) = self.write_buffer(&mut state) {
                return Err(self.fail(&mut state, err));
            }
        }

        Ok(lsn)
    }

    /// Drops whatever is still buffered and poisons the writer. Records
    /// that did not reach the file are never written later, and bytes a
    /// partial write left behind are cut off as a torn tail on recovery.
    fn fail(&self, state: &mut WriterState, err: WalError) -> WalError {
        state.buffer.clear();
        let failure = self.poison(err);
        tracing::error!(error = %failure, "WAL write failed, refusing further writes");
        failure
    }

    fn check_not_failed(&self) -> WalResult<()> {
        match self.failure.lock().as_ref() {
            Some(failure) => Err(failure
                .duplicate_flush_failure()
                .unwrap_or(WalError::Closed)),
            None => Ok(()),
        }
    }

    /// Ensures the active segment can take the buffer plus `record_size`
    /// more bytes, rotating if it cannot.
    fn ensure_segment_space(
        &self,
        state: &mut WriterState,
        record_size: usize,
        first_lsn: Lsn,
    ) -> WalResult<()> {
        let needs_rotation = match state.segment.as_ref() {
            None => true,
            Some(seg) => !seg.has_space_for(state.buffer.len() + record_size),
        };

        if needs_rotation {
            self.rotate_segment(state, first_lsn)?;
        }

        Ok(())
    }

    /// Seals the current segment (writing out and syncing its buffered
    /// records) and starts a new one.
    fn rotate_segment(&self, state: &mut WriterState, first_lsn: Lsn) -> WalResult<()> {
        if state.segment.is_some() {
            self.write_buffer(state)?;
            if let Some(old) = state.segment.as_mut() {
                if self.config.syncs() {
                    old.sync()?;
                    self.mark_durable(self.written_lsn());
                }
                old.seal();
                tracing::debug!(segment_id = old.segment_id(), "sealed WAL segment");
            }
        }

        let segment_id = state.next_segment_id;
        let segment = WalSegment::create(segment_id, &self.config, first_lsn)?;
        state.next_segment_id += 1;
        state.segment = Some(segment);
        self.stats.segment_rotations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(segment_id, first_lsn = %first_lsn, "opened WAL segment");
        Ok(())
    }

    /// Seals the active segment and starts a new one even if the active
    /// one has room left.
    pub fn switch_segment(&self) -> WalResult<SegmentSwitch> {
        let mut state = self.state.lock();
        self.check_usable()?;

        let previous = state.segment.as_ref().map(WalSegment::segment_id);
        let first_lsn = state.next_lsn;
        if let Err(err) = self.rotate_segment(&mut state, first_lsn) {
            return Err(self.fail(&mut state, err));
        }
        Ok(SegmentSwitch {
            previous,
            current: state.next_segment_id - 1,
            first_lsn,
        })
    }

    fn write_buffer(&self, state: &mut WriterState) -> WalResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let WriterState {
            segment, buffer, ..
        } = state;
        match segment.as_mut() {
            Some(segment) => segment.append(buffer)?,
            None => {
                return Err(WalError::Io {
                    source: io::Error::new(io::ErrorKind::Other, "no active WAL segment"),
                })
            }
        }
        buffer.clear();
        self.written_lsn
            .store(self.last_lsn.load(Ordering::Acquire), Ordering::Release);
        self.stats.buffer_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes buffered records to the active segment.
    ///
    /// Returns the last LSN now in the file and a handle to sync it with.
    pub fn write_out(&self) -> WalResult<(Lsn, Option<Arc<File>>)> {
        let mut state = self.state.lock();
        self.check_not_failed()?;
        if let Err(err) = self.write_buffer(&mut state) {
            return Err(self.fail(&mut state, err));
        }
        let handle = state.segment.as_ref().map(WalSegment::sync_handle);
        Ok((self.written_lsn(), handle))
    }

    /// Returns an error if the writer is closed or a flush has failed.
    pub fn check_usable(&self) -> WalResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        self.check_not_failed()
    }

    /// Puts the writer into the failed state and returns the error every
    /// waiter should see. Any error other than `Closed` becomes a
    /// `FlushFailed` covering everything handed out so far.
    pub fn poison(&self, err: WalError) -> WalError {
        let failure = match err {
            WalError::Closed => return WalError::Closed,
            WalError::Io { source } => WalError::flush_failed(self.last_lsn(), &source),
            other @ WalError::FlushFailed { .. } => other,
            other => WalError::flush_failed(
                self.last_lsn(),
                &io::Error::new(io::ErrorKind::Other, other.to_string()),
            ),
        };
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = failure.duplicate_flush_failure();
        }
        failure
    }

    /// Returns writer statistics.
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Closes the writer. Buffered records are written out and synced,
    /// unless the writer has failed, in which case nothing more is written.
    pub fn close(&self) -> WalResult<()> {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(failure) = self.check_not_failed() {
            state.buffer.clear();
            return Err(failure);
        }
        let written = self.write_buffer(&mut state).and_then(|()| {
            match state.segment.as_mut() {
                Some(segment) => {
                    segment.sync()?;
                    segment.seal();
                    Ok(())
                }
                None => Ok(()),
            }
        });
        if let Err(err) = written {
            return Err(self.fail(&mut state, err));
        }
        self.mark_durable(self.written_lsn());
        Ok(())
    }

    /// Returns true if the writer is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("next_lsn", &self.next_lsn())
            .field("durable_lsn", &self.durable_lsn())
            .field("closed", &self.is_closed())
            .field(
                "records_written",
                &self.stats.records_written.load(Ordering::Relaxed),
            )
            .finish()
    }
}
