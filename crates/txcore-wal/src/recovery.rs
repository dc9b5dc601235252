//! Replay of the log after a restart.
//!
//! [`replay`] reads every segment in order and groups data records by
//! transaction. A commit record moves the transaction's surviving
//! operations into the report; an abort record or a missing end record
//! discards them. Compensation records written by partial rollbacks drop
//! the operations they undo before the commit is seen.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use txcore_common::types::{Lsn, RowKey, Timestamp, TxnId};

use crate::config::WalConfig;
use crate::error::WalResult;
use crate::reader::WalReader;
use crate::record::types::WalPayload;

pub use crate::reader::TornTail;

/// A change to re-apply for a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    /// Row written (inserted or updated).
    Put {
        /// Row key.
        key: RowKey,
        /// Row image.
        value: Bytes,
    },
    /// Row deleted.
    Delete {
        /// Row key.
        key: RowKey,
    },
}

impl RedoOp {
    /// Returns the row this operation touches.
    pub fn key(&self) -> RowKey {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => *key,
        }
    }
}

/// A committed transaction found in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTxn {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Commit timestamp from the commit record.
    pub commit_ts: Timestamp,
    /// LSN of the commit record.
    pub commit_lsn: Lsn,
    /// Surviving operations in LSN order.
    pub ops: Vec<RedoOp>,
}

/// Result of replaying a WAL directory.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Committed transactions in commit order.
    pub committed: Vec<RecoveredTxn>,
    /// Transactions with an abort record.
    pub aborted: Vec<TxnId>,
    /// Transactions with data but neither commit nor abort.
    pub incomplete: Vec<TxnId>,
    /// LSN the next appended record should get.
    pub next_lsn: Lsn,
    /// Id for the next segment file.
    pub next_segment_id: u64,
    /// Highest transaction id seen.
    pub max_txn_id: TxnId,
    /// Highest commit timestamp seen.
    pub max_commit_ts: Timestamp,
    /// Records read (segment headers excluded).
    pub records_scanned: u64,
    /// Segment files read.
    pub segments_scanned: usize,
    /// Unreadable tail of the last segment, if any.
    pub torn_tail: Option<TornTail>,
}

impl RecoveryReport {
    /// Returns true if the log held no records.
    pub fn is_empty(&self) -> bool {
        self.records_scanned == 0
    }

    /// Returns the number of redo operations across committed transactions.
    pub fn redo_op_count(&self) -> usize {
        self.committed.iter().map(|t| t.ops.len()).sum()
    }
}

/// Reads the WAL in `config.dir` and reports what it contains.
///
/// The directory is not modified; a torn tail is only reported. A missing
/// directory is an empty log.
pub fn replay(config: &WalConfig) -> WalResult<RecoveryReport> {
    let reader = WalReader::open(config)?;
    let mut report = RecoveryReport {
        next_lsn: Lsn::FIRST,
        next_segment_id: reader.segment_ids().last().map_or(0, |id| id + 1),
        segments_scanned: reader.segment_count(),
        ..RecoveryReport::default()
    };

    let mut pending: HashMap<TxnId, Vec<(Lsn, RedoOp)>> = HashMap::new();
    let mut records = reader.records();

    for record in records.by_ref() {
        let record = record?;
        let lsn = record.lsn();
        let txn_id = record.txn_id();

        report.records_scanned += 1;
        report.next_lsn = report.next_lsn.max(lsn.next());
        report.max_txn_id = report.max_txn_id.max(txn_id);

        match record.payload {
            WalPayload::Insert(p) => pending.entry(txn_id).or_default().push((
                lsn,
                RedoOp::Put {
                    key: p.key,
                    value: p.value,
                },
            )),
            WalPayload::Update(p) => pending.entry(txn_id).or_default().push((
                lsn,
                RedoOp::Put {
                    key: p.key,
                    value: p.value,
                },
            )),
            WalPayload::Delete(p) => pending
                .entry(txn_id)
                .or_default()
                .push((lsn, RedoOp::Delete { key: p.key })),
            WalPayload::Compensation(p) => {
                let ops = pending.entry(txn_id).or_default();
                ops.retain(|(op_lsn, _)| *op_lsn <= p.undo_to);
            }
            WalPayload::Commit(p) => {
                let ops = pending
                    .remove(&txn_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(_, op)| op)
                    .collect();
                report.max_commit_ts = report.max_commit_ts.max(p.commit_timestamp);
                report.committed.push(RecoveredTxn {
                    txn_id,
                    commit_ts: p.commit_timestamp,
                    commit_lsn: lsn,
                    ops,
                });
            }
            WalPayload::Abort => {
                pending.remove(&txn_id);
                report.aborted.push(txn_id);
            }
            WalPayload::SegmentHeader(_) => {}
        }
    }

    report.torn_tail = records.into_torn_tail();
    report.incomplete = pending.into_keys().collect();
    report.incomplete.sort();

    tracing::info!(
        records = report.records_scanned,
        segments = report.segments_scanned,
        committed = report.committed.len(),
        aborted = report.aborted.len(),
        incomplete = report.incomplete.len(),
        next_lsn = %report.next_lsn,
        torn_tail = report.torn_tail.is_some(),
        "WAL replay finished"
    );

    Ok(report)
}

/// Collapses the committed operations of a report into the final image of
/// every row, in key order. `None` marks a deleted row.
pub fn final_images(report: &RecoveryReport) -> BTreeMap<RowKey, Option<Bytes>> {
    let mut rows = BTreeMap::new();
    for txn in &report.committed {
        for op in &txn.ops {
            match op {
                RedoOp::Put { key, value } => rows.insert(*key, Some(value.clone())),
                RedoOp::Delete { key } => rows.insert(*key, None),
            };
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        CommitPayload, CompensationPayload, DeletePayload, InsertPayload, UpdatePayload,
    };
    use crate::writer::WalWriter;
    use std::sync::Arc;
    use tempfile::TempDir;
    use txcore_common::types::TableId;

    fn key(row: u64) -> RowKey {
        RowKey::new(TableId::new(1), row)
    }

    fn put(row: u64, value: &'static str) -> WalPayload {
        WalPayload::Insert(InsertPayload {
            key: key(row),
            value: Bytes::from(value),
        })
    }

    fn commit(ts: u64) -> WalPayload {
        WalPayload::Commit(CommitPayload {
            commit_timestamp: Timestamp::new(ts),
        })
    }

    fn writer(config: &WalConfig) -> WalWriter {
        WalWriter::new(Arc::new(config.clone()), Lsn::FIRST, 0)
    }

    #[test]
    fn test_replay_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let report = replay(&WalConfig::new(tmp.path())).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.next_lsn, Lsn::FIRST);
        assert_eq!(report.next_segment_id, 0);
    }

    #[test]
    fn test_replay_groups_by_outcome() {
        let tmp = TempDir::new().unwrap();
        let config = WalConfig::new(tmp.path());
        let w = writer(&config);

        let (t1, t2, t3) = (TxnId::new(1), TxnId::new(2), TxnId::new(3));
        w.append(t1, put(1, "alice")).unwrap();
        w.append(t2, put(2, "bob")).unwrap();
        w.append(t3, put(3, "carol")).unwrap();
        w.append(t1, commit(5)).unwrap();
        w.append(t2, WalPayload::Abort).unwrap();
        w.close().unwrap();

        let report = replay(&config).unwrap();
        assert_eq!(report.records_scanned, 5);
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].txn_id, t1);
        assert_eq!(report.committed[0].commit_ts, Timestamp::new(5));
        assert_eq!(report.committed[0].commit_lsn, Lsn::new(4));
        assert_eq!(report.aborted, vec![t2]);
        assert_eq!(report.incomplete, vec![t3]);
        assert_eq!(report.next_lsn, Lsn::new(6));
        assert_eq!(report.max_txn_id, t3);
        assert_eq!(report.max_commit_ts, Timestamp::new(5));
        assert_eq!(report.next_segment_id, 1);
    }

    #[test]
    fn test_compensation_drops_undone_ops() {
        let tmp = TempDir::new().unwrap();
        let config = WalConfig::new(tmp.path());
        let w = writer(&config);
        let t = TxnId::new(7);

        let keep = w.append(t, put(1, "kept")).unwrap();
        w.append(
            t,
            WalPayload::Update(UpdatePayload {
                key: key(1),
                value: Bytes::from("undone"),
            }),
        )
        .unwrap();
        w.append(t, WalPayload::Delete(DeletePayload { key: key(2) }))
            .unwrap();
        w.append(
            t,
            WalPayload::Compensation(CompensationPayload { undo_to: keep }),
        )
        .unwrap();
        w.append(t, WalPayload::Delete(DeletePayload { key: key(3) }))
            .unwrap();
        w.append(t, commit(9)).unwrap();
        w.close().unwrap();

        let report = replay(&config).unwrap();
        let ops = &report.committed[0].ops;
        assert_eq!(
            ops,
            &vec![
                RedoOp::Put {
                    key: key(1),
                    value: Bytes::from("kept"),
                },
                RedoOp::Delete { key: key(3) },
            ]
        );
        assert_eq!(report.redo_op_count(), 2);
    }

    #[test]
    fn test_final_images() {
        let tmp = TempDir::new().unwrap();
        let config = WalConfig::new(tmp.path());
        let w = writer(&config);

        w.append(TxnId::new(1), put(1, "v1")).unwrap();
        w.append(TxnId::new(1), put(2, "gone")).unwrap();
        w.append(TxnId::new(1), commit(1)).unwrap();
        w.append(
            TxnId::new(2),
            WalPayload::Update(UpdatePayload {
                key: key(1),
                value: Bytes::from("v2"),
            }),
        )
        .unwrap();
        w.append(TxnId::new(2), WalPayload::Delete(DeletePayload { key: key(2) }))
            .unwrap();
        w.append(TxnId::new(2), commit(2)).unwrap();
        w.close().unwrap();

        let rows = final_images(&replay(&config).unwrap());
        assert_eq!(rows.get(&key(1)), Some(&Some(Bytes::from("v2"))));
        assert_eq!(rows.get(&key(2)), Some(&None));
    }

    #[test]
    fn test_unflushed_records_are_lost() {
        let tmp = TempDir::new().unwrap();
        let config = WalConfig::new(tmp.path());
        let w = writer(&config);

        w.append(TxnId::new(1), put(1, "durable")).unwrap();
        w.append(TxnId::new(1), commit(1)).unwrap();
        w.write_out().unwrap();
        w.append(TxnId::new(2), put(2, "buffered")).unwrap();
        w.append(TxnId::new(2), commit(2)).unwrap();
        drop(w);

        let report = replay(&config).unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.next_lsn, Lsn::new(3));
    }
}
