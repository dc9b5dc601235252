//! Main WAL manager.
//!
//! This module provides the `Wal` struct that ties the writer, the group
//! commit manager and recovery together. Transactions talk to it through
//! the [`CommitLog`] trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use txcore_common::types::{Lsn, Timestamp, TxnId};

use crate::config::{SyncPolicy, WalConfig};
use crate::error::WalResult;
use crate::group_commit::GroupCommitManager;
use crate::record::payload::{
    CommitPayload, CompensationPayload, DeletePayload, InsertPayload, UpdatePayload,
};
use crate::record::types::WalPayload;
use crate::recovery::{self, RecoveryReport};
use crate::segment::{self, SegmentInfo, SegmentSwitch};
use crate::writer::WalWriter;

/// The log as seen by the transaction manager.
pub trait CommitLog: Send + Sync {
    /// Appends a record for `txn_id` and returns its LSN. The record is
    /// not durable until [`flush`](Self::flush) covers it.
    fn append(&self, txn_id: TxnId, payload: WalPayload) -> WalResult<Lsn>;

    /// Blocks until every record up to `upto` is durable.
    fn flush(&self, upto: Lsn) -> WalResult<()>;

    /// Returns a statistics snapshot.
    fn stats(&self) -> WalStatsSnapshot;

    /// Flushes outstanding records and refuses further appends.
    fn close(&self) -> WalResult<()>;

    /// Lists the segment files, oldest first.
    fn segments(&self) -> WalResult<Vec<SegmentInfo>>;

    /// Seals the active segment and continues in a new one.
    fn switch_segment(&self) -> WalResult<SegmentSwitch>;
}

/// Point-in-time WAL statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WalStatsSnapshot {
    /// Last LSN handed out.
    pub current_lsn: Lsn,
    /// Last LSN written to a segment file.
    pub write_lsn: Lsn,
    /// Last LSN on stable storage.
    pub flush_lsn: Lsn,
    /// Records appended since open.
    pub records: u64,
    /// Bytes appended since open.
    pub bytes: u64,
    /// fsync calls issued by group commit.
    pub syncs: u64,
    /// Flush batches run by group commit.
    pub flush_batches: u64,
    /// Segments opened since start.
    pub segment_rotations: u64,
    /// Segment currently written.
    pub active_segment: Option<u64>,
    /// Configured sync policy.
    pub sync_policy: SyncPolicy,
    /// Mean time spent in `append`, in microseconds.
    pub avg_append_latency_us: f64,
    /// Mean fsync time, in microseconds.
    pub avg_sync_latency_us: f64,
}

#[derive(Debug, Default)]
struct WalStats {
    appends: AtomicU64,
    append_nanos: AtomicU64,
}

/// The main Write-Ahead Log manager.
pub struct Wal {
    config: Arc<WalConfig>,
    writer: Arc<WalWriter>,
    group_commit: GroupCommitManager,
    stats: WalStats,
}

impl Wal {
    /// Opens the WAL in `config.dir`, replaying whatever it holds.
    ///
    /// A torn tail is cut off before the writer starts; new records always
    /// go to a fresh segment.
    pub fn recover(config: WalConfig) -> WalResult<(Self, RecoveryReport)> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let report = recovery::replay(&config)?;
        if let Some(tail) = &report.torn_tail {
            tracing::warn!(
                segment_id = tail.segment_id,
                offset = tail.offset,
                reason = %tail.reason,
                "truncating torn WAL tail"
            );
            tail.repair()?;
        }

        let config = Arc::new(config);
        let writer = Arc::new(WalWriter::new(
            Arc::clone(&config),
            report.next_lsn,
            report.next_segment_id,
        ));

        let delay = match config.sync_policy {
            SyncPolicy::GroupCommit => config.group_commit_delay,
            SyncPolicy::EveryWrite | SyncPolicy::Never => Duration::ZERO,
        };
        let group_commit = GroupCommitManager::new(Arc::clone(&writer), delay, config.syncs());

        tracing::info!(
            dir = %config.dir.display(),
            next_lsn = %report.next_lsn,
            committed = report.committed.len(),
            sync_policy = ?config.sync_policy,
            "WAL opened"
        );

        Ok((
            Self {
                config,
                writer,
                group_commit,
                stats: WalStats::default(),
            },
            report,
        ))
    }

    /// Opens the WAL, discarding the recovery report.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        Ok(Self::recover(config)?.0)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        self.writer.next_lsn()
    }

    /// Returns the last durable LSN.
    pub fn durable_lsn(&self) -> Lsn {
        self.writer.durable_lsn()
    }

    /// Appends a record. With [`SyncPolicy::EveryWrite`] the record is
    /// durable when this returns.
    pub fn append(&self, txn_id: TxnId, payload: WalPayload) -> WalResult<Lsn> {
        let start = Instant::now();
        let lsn = self.writer.append(txn_id, payload)?;
        self.stats.appends.fetch_add(1, Ordering::Relaxed);
        self.stats
            .append_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if self.config.sync_policy == SyncPolicy::EveryWrite {
            self.group_commit.flush(lsn)?;
        }
        Ok(lsn)
    }

    /// Logs an insert.
    pub fn log_insert(&self, txn_id: TxnId, payload: InsertPayload) -> WalResult<Lsn> {
        self.append(txn_id, WalPayload::Insert(payload))
    }

    /// Logs an update.
    pub fn log_update(&self, txn_id: TxnId, payload: UpdatePayload) -> WalResult<Lsn> {
        self.append(txn_id, WalPayload::Update(payload))
    }

    /// Logs a delete.
    pub fn log_delete(&self, txn_id: TxnId, payload: DeletePayload) -> WalResult<Lsn> {
        self.append(txn_id, WalPayload::Delete(payload))
    }

    /// Logs a commit and waits until it is durable.
    pub fn log_commit(&self, txn_id: TxnId, commit_timestamp: Timestamp) -> WalResult<Lsn> {
        let lsn = self.append(
            txn_id,
            WalPayload::Commit(CommitPayload { commit_timestamp }),
        )?;
        self.flush(lsn)?;
        Ok(lsn)
    }

    /// Logs an abort. Aborts are not flushed.
    pub fn log_abort(&self, txn_id: TxnId) -> WalResult<Lsn> {
        self.append(txn_id, WalPayload::Abort)
    }

    /// Logs a partial rollback of everything after `undo_to`.
    pub fn log_compensation(&self, txn_id: TxnId, undo_to: Lsn) -> WalResult<Lsn> {
        self.append(
            txn_id,
            WalPayload::Compensation(CompensationPayload { undo_to }),
        )
    }

    /// Blocks until every record up to `upto` is durable.
    pub fn flush(&self, upto: Lsn) -> WalResult<()> {
        self.group_commit.flush(upto)
    }

    /// Flushes everything appended so far.
    pub fn flush_all(&self) -> WalResult<()> {
        self.group_commit.flush_all()
    }

    /// Flushes and closes the WAL. Later appends fail with
    /// [`WalError::Closed`](crate::WalError::Closed).
    pub fn close(&self) -> WalResult<()> {
        if self.writer.is_closed() {
            return Ok(());
        }
        // Close even after a failed flush, so the writer stops for good.
        let flushed = self.flush_all();
        flushed.and(self.writer.close())?;
        tracing::info!(last_lsn = %self.writer.last_lsn(), "WAL closed");
        Ok(())
    }

    /// Returns true if the WAL is closed.
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Lists the segment files, oldest first.
    pub fn segments(&self) -> WalResult<Vec<SegmentInfo>> {
        segment::list_segments(&self.config, self.writer.active_segment_id())
    }

    /// Seals the active segment and continues in a new one, e.g. before
    /// copying the sealed segments elsewhere.
    pub fn switch_segment(&self) -> WalResult<SegmentSwitch> {
        let switch = self.writer.switch_segment()?;
        tracing::info!(
            previous = ?switch.previous,
            current = switch.current,
            first_lsn = %switch.first_lsn,
            "switched WAL segment"
        );
        Ok(switch)
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> WalStatsSnapshot {
        let writer = self.writer.stats();
        let gc = self.group_commit.stats();
        let appends = self.stats.appends.load(Ordering::Relaxed);
        let syncs = gc.syncs.load(Ordering::Relaxed);

        WalStatsSnapshot {
            current_lsn: self.writer.last_lsn(),
            write_lsn: self.writer.written_lsn(),
            flush_lsn: self.writer.durable_lsn(),
            records: writer.records_written.load(Ordering::Relaxed),
            bytes: writer.bytes_written.load(Ordering::Relaxed),
            syncs,
            flush_batches: gc.batches.load(Ordering::Relaxed),
            segment_rotations: writer.segment_rotations.load(Ordering::Relaxed),
            active_segment: self.writer.active_segment_id(),
            sync_policy: self.config.sync_policy,
            avg_append_latency_us: average_us(
                self.stats.append_nanos.load(Ordering::Relaxed),
                appends,
            ),
            avg_sync_latency_us: average_us(gc.sync_nanos.load(Ordering::Relaxed), syncs),
        }
    }
}

fn average_us(total_nanos: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_nanos as f64 / count as f64 / 1_000.0
    }
}

impl CommitLog for Wal {
    fn append(&self, txn_id: TxnId, payload: WalPayload) -> WalResult<Lsn> {
        Wal::append(self, txn_id, payload)
    }

    fn flush(&self, upto: Lsn) -> WalResult<()> {
        Wal::flush(self, upto)
    }

    fn stats(&self) -> WalStatsSnapshot {
        Wal::stats(self)
    }

    fn close(&self) -> WalResult<()> {
        Wal::close(self)
    }

    fn segments(&self) -> WalResult<Vec<SegmentInfo>> {
        Wal::segments(self)
    }

    fn switch_segment(&self) -> WalResult<SegmentSwitch> {
        Wal::switch_segment(self)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "WAL close on drop failed");
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("config", &self.config)
            .field("next_lsn", &self.next_lsn())
            .field("durable_lsn", &self.durable_lsn())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WalError;
    use crate::recovery::RedoOp;
    use bytes::Bytes;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;
    use txcore_common::types::{RowKey, TableId};

    fn test_config(dir: &Path) -> WalConfig {
        WalConfig::new(dir)
            .with_segment_size(1024 * 1024)
            .with_max_record_size(256 * 1024)
            .with_sync_policy(SyncPolicy::EveryWrite)
    }

    fn insert(row: u64, value: &'static str) -> InsertPayload {
        InsertPayload {
            key: RowKey::new(TableId::new(1), row),
            value: Bytes::from(value),
        }
    }

    #[test]
    fn test_wal_creation() {
        let tmp = TempDir::new().unwrap();
        let (wal, report) = Wal::recover(test_config(tmp.path())).unwrap();

        assert!(report.is_empty());
        assert!(!wal.is_closed());
        assert_eq!(wal.next_lsn(), Lsn::FIRST);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = WalConfig::new(tmp.path()).with_segment_size(16);
        assert!(matches!(
            Wal::open(config),
            Err(WalError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_log_operations() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(test_config(tmp.path())).unwrap();
        let txn_id = TxnId::new(1);

        let lsn1 = wal.log_insert(txn_id, insert(1, "value1")).unwrap();
        let lsn2 = wal
            .log_update(
                txn_id,
                UpdatePayload {
                    key: RowKey::new(TableId::new(1), 1),
                    value: Bytes::from("value2"),
                },
            )
            .unwrap();
        let lsn3 = wal.log_commit(txn_id, Timestamp::new(3)).unwrap();

        assert!(lsn2 > lsn1);
        assert!(lsn3 > lsn2);
        assert_eq!(wal.durable_lsn(), lsn3);

        let stats = wal.stats();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.current_lsn, lsn3);
        assert_eq!(stats.flush_lsn, lsn3);
        assert!(stats.syncs >= 1);
    }

    #[test]
    fn test_wal_close() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(test_config(tmp.path())).unwrap();

        wal.close().unwrap();
        assert!(wal.is_closed());

        let result = wal.log_insert(TxnId::new(1), insert(1, "late"));
        assert!(matches!(result, Err(WalError::Closed)));
    }

    #[test]
    fn test_reopen_replays_committed() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path()).with_sync_policy(SyncPolicy::GroupCommit);

        {
            let wal = Wal::open(config.clone()).unwrap();
            wal.log_insert(TxnId::new(1), insert(1, "alice")).unwrap();
            wal.log_commit(TxnId::new(1), Timestamp::new(2)).unwrap();
            wal.log_insert(TxnId::new(2), insert(2, "bob")).unwrap();
            wal.log_abort(TxnId::new(2)).unwrap();
            wal.close().unwrap();
        }

        let (wal, report) = Wal::recover(config).unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(
            report.committed[0].ops,
            vec![RedoOp::Put {
                key: RowKey::new(TableId::new(1), 1),
                value: Bytes::from("alice"),
            }]
        );
        assert_eq!(report.aborted, vec![TxnId::new(2)]);
        assert_eq!(wal.next_lsn(), Lsn::new(5));

        // New records continue the LSN sequence in a new segment.
        let lsn = wal.log_insert(TxnId::new(3), insert(3, "carol")).unwrap();
        assert_eq!(lsn, Lsn::new(5));
        assert_eq!(wal.stats().active_segment, Some(1));
    }

    #[test]
    fn test_switched_segments_replay_in_order() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let wal = Wal::open(config.clone()).unwrap();
            wal.log_insert(TxnId::new(1), insert(1, "alice")).unwrap();
            let switch = wal.switch_segment().unwrap();
            assert_eq!(switch.previous, Some(0));
            assert_eq!(switch.current, 1);
            wal.log_commit(TxnId::new(1), Timestamp::new(2)).unwrap();
            // A switch with nothing written leaves a header-only segment.
            wal.switch_segment().unwrap();

            let segments = wal.segments().unwrap();
            let ids: Vec<u64> = segments.iter().map(|s| s.segment_id).collect();
            assert_eq!(ids, vec![0, 1, 2]);
            assert_eq!(
                segments.iter().filter(|s| s.active).map(|s| s.segment_id).collect::<Vec<_>>(),
                vec![2]
            );
            assert_eq!(wal.stats().segment_rotations, 3);
            wal.close().unwrap();
        }

        let (wal, report) = Wal::recover(config).unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].txn_id, TxnId::new(1));
        assert_eq!(wal.next_lsn(), Lsn::new(3));
        assert!(report.torn_tail.is_none());
    }

    #[test]
    fn test_compensation_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let wal = Wal::open(config.clone()).unwrap();
            let t = TxnId::new(4);
            let keep = wal.log_insert(t, insert(1, "kept")).unwrap();
            wal.log_insert(t, insert(2, "rolled back")).unwrap();
            wal.log_compensation(t, keep).unwrap();
            wal.log_commit(t, Timestamp::new(1)).unwrap();
        }

        let (_wal, report) = Wal::recover(config).unwrap();
        assert_eq!(report.redo_op_count(), 1);
        assert_eq!(report.committed[0].ops[0].key(), RowKey::new(TableId::new(1), 1));
    }

    #[test]
    fn test_torn_tail_is_repaired() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let wal = Wal::open(config.clone()).unwrap();
            wal.log_insert(TxnId::new(1), insert(1, "alice")).unwrap();
            wal.log_commit(TxnId::new(1), Timestamp::new(1)).unwrap();
        }
        let segment = config.segment_path(0);
        let clean_len = std::fs::metadata(&segment).unwrap().len();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&segment)
                .unwrap();
            file.write_all(&[0xAB; 23]).unwrap();
        }

        let (wal, report) = Wal::recover(config.clone()).unwrap();
        let tail = report.torn_tail.expect("torn tail reported");
        assert_eq!(tail.offset, clean_len);
        assert_eq!(report.committed.len(), 1);
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), clean_len);
        drop(wal);

        let (_wal, report) = Wal::recover(config).unwrap();
        assert!(report.torn_tail.is_none());
        assert_eq!(report.committed.len(), 1);
    }

    #[test]
    fn test_concurrent_commits() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path()).with_sync_policy(SyncPolicy::GroupCommit);
        let wal = Arc::new(Wal::open(config.clone()).unwrap());

        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let wal = Arc::clone(&wal);
                std::thread::spawn(move || {
                    let txn = TxnId::new(n);
                    wal.log_insert(txn, insert(n, "row")).unwrap();
                    let lsn = wal.log_commit(txn, Timestamp::new(n)).unwrap();
                    assert!(wal.durable_lsn() >= lsn);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = wal.stats();
        assert_eq!(stats.records, 16);
        assert!(stats.flush_batches <= 8);
        drop(wal);

        let (_wal, report) = Wal::recover(config).unwrap();
        assert_eq!(report.committed.len(), 8);
    }

    #[test]
    fn test_stats_serialize() {
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(test_config(tmp.path())).unwrap();
        wal.log_insert(TxnId::new(1), insert(1, "x")).unwrap();

        let json = serde_json::to_value(wal.stats()).unwrap();
        assert_eq!(json["sync_policy"], "every_write");
        assert_eq!(json["records"], 1);
    }
}
