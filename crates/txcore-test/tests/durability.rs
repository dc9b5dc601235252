//! WAL durability across restarts.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use txcore_common::types::{IsolationLevel, TxnId};
use txcore_test::{users, TestCore};
use txcore_wal::RedoOp;

#[test]
fn test_committed_change_survives_restart() {
    let core = TestCore::new();
    let tm = core.tm();

    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(1), Bytes::from("alice")).unwrap();
    tm.write(txn, users(2), Bytes::from("bob")).unwrap();
    tm.commit(txn).unwrap();

    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(2), Bytes::from("robert")).unwrap();
    assert!(tm.delete(txn, users(1)).unwrap());
    tm.commit(txn).unwrap();

    let core = core.restart();
    assert_eq!(core.report().committed.len(), 2);
    assert_eq!(
        core.report().committed[1].ops,
        vec![
            RedoOp::Put {
                key: users(2),
                value: Bytes::from("robert"),
            },
            RedoOp::Delete { key: users(1) },
        ]
    );

    let tm = core.tm();
    let reader = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), None);
    assert_eq!(tm.read(reader, users(2)).unwrap(), Some(Bytes::from("robert")));
}

#[test]
fn test_aborted_and_unfinished_writes_never_replay() {
    let core = TestCore::new();
    let tm = core.tm();

    let kept = tm.begin_default().unwrap();
    tm.write(kept, users(1), Bytes::from("kept")).unwrap();
    tm.commit(kept).unwrap();

    let aborted = tm.begin_default().unwrap();
    tm.write(aborted, users(1), Bytes::from("aborted")).unwrap();
    tm.abort(aborted).unwrap();

    let unfinished = tm.begin_default().unwrap();
    tm.write(unfinished, users(3), Bytes::from("unfinished")).unwrap();

    let core = core.crash_and_reopen();
    let report = core.report();
    assert_eq!(report.committed.len(), 1);
    assert_eq!(report.aborted, vec![aborted]);
    assert_eq!(report.incomplete, vec![unfinished]);

    let tm = core.tm();
    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("kept")));
    assert_eq!(tm.read(reader, users(3)).unwrap(), None);

    // New transactions never reuse an id found in the log.
    assert!(reader > unfinished);
}

#[test]
fn test_savepoint_rollback_survives_restart() {
    let core = TestCore::new();
    let tm = core.tm();

    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(1), Bytes::from("first")).unwrap();
    tm.savepoint(txn, "sp").unwrap();
    tm.write(txn, users(1), Bytes::from("second")).unwrap();
    tm.write(txn, users(2), Bytes::from("gone")).unwrap();
    tm.rollback_to_savepoint(txn, "sp").unwrap();
    tm.write(txn, users(3), Bytes::from("third")).unwrap();
    tm.commit(txn).unwrap();

    let core = core.restart();
    let tm = core.tm();
    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("first")));
    assert_eq!(tm.read(reader, users(2)).unwrap(), None);
    assert_eq!(tm.read(reader, users(3)).unwrap(), Some(Bytes::from("third")));
}

#[test]
fn test_commit_order_preserved_on_replay() {
    let core = TestCore::new();
    let tm = core.tm();

    for round in 0..5u64 {
        let txn = tm.begin_default().unwrap();
        tm.write(txn, users(1), Bytes::from(format!("round {round}")))
            .unwrap();
        tm.commit(txn).unwrap();
    }
    let clock_before = tm.mvcc_status().clock;

    let core = core.restart();
    let tm = core.tm();
    assert!(tm.mvcc_status().clock >= clock_before);

    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("round 4")));
    assert_eq!(tm.row_versions(&users(1)).len(), 5);

    // Fresh commits land after everything recovered.
    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(1), Bytes::from("after restart")).unwrap();
    tm.commit(txn).unwrap();
    let reader = tm.begin_default().unwrap();
    assert_eq!(
        tm.read(reader, users(1)).unwrap(),
        Some(Bytes::from("after restart"))
    );
}

#[test]
fn test_torn_tail_is_discarded() {
    let core = TestCore::new();
    let tm = core.tm();

    let txn = tm.begin_default().unwrap();
    tm.write(txn, users(1), Bytes::from("whole")).unwrap();
    tm.commit(txn).unwrap();

    // A partial record after the last complete one.
    let core = core.restart_with(|dir| {
        let segment = newest_segment(dir);
        let mut file = OpenOptions::new().append(true).open(segment).unwrap();
        file.write_all(&[0xAB; 7]).unwrap();
        file.sync_all().unwrap();
    });
    assert!(core.report().torn_tail.is_some());
    assert_eq!(core.report().committed.len(), 1);

    let tm = core.tm();
    let reader = tm.begin_default().unwrap();
    assert_eq!(tm.read(reader, users(1)).unwrap(), Some(Bytes::from("whole")));
    assert!(reader > TxnId::new(1));

    // The tail was cut off, so the next open is clean.
    let core = core.restart();
    assert!(core.report().torn_tail.is_none());
}

fn newest_segment(dir: &Path) -> PathBuf {
    let mut segments: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    segments.sort();
    segments.pop().expect("no segment files")
}
