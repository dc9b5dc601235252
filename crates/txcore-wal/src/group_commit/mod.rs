//! Group commit implementation.
//!
//! Group commit batches multiple fsync calls together for better throughput.
//! The first caller that finds no flush in progress becomes the leader: it
//! optionally waits `group_commit_delay` for more records, writes out the
//! writer's buffer and syncs it. Everyone who arrives meanwhile waits on a
//! condition variable and is released when a batch covering their LSN
//! completes.
//!
//! A failed batch poisons the writer, so every waiter of that batch (and
//! every later caller) gets the same [`WalError::FlushFailed`](crate::WalError::FlushFailed). Nothing is
//! retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use txcore_common::types::Lsn;

use crate::error::WalResult;
use crate::writer::WalWriter;

/// Group commit statistics.
#[derive(Debug, Default)]
pub struct GroupCommitStats {
    /// Completed flush batches.
    pub batches: AtomicU64,
    /// fsync calls issued by batches.
    pub syncs: AtomicU64,
    /// Total time spent in fsync, in nanoseconds.
    pub sync_nanos: AtomicU64,
    /// Callers that waited for another caller's batch.
    pub followers: AtomicU64,
}

#[derive(Debug, Default)]
struct BatchState {
    leader_active: bool,
}

/// Group commit manager.
///
/// Batches concurrent flush requests and performs them together.
pub struct GroupCommitManager {
    writer: Arc<WalWriter>,
    delay: Duration,
    sync: bool,
    state: Mutex<BatchState>,
    batch_done: Condvar,
    stats: GroupCommitStats,
}

impl GroupCommitManager {
    /// Creates a new group commit manager.
    ///
    /// With `sync` unset batches only write out the buffer.
    pub fn new(writer: Arc<WalWriter>, delay: Duration, sync: bool) -> Self {
        Self {
            writer,
            delay,
            sync,
            state: Mutex::new(BatchState::default()),
            batch_done: Condvar::new(),
            stats: GroupCommitStats::default(),
        }
    }

    /// Blocks until every record up to `upto` is durable.
    ///
    /// This will either:
    /// 1. Return immediately if `upto` is already durable
    /// 2. Wait for a batch in progress, then re-check
    /// 3. Lead a new batch
    pub fn flush(&self, upto: Lsn) -> WalResult<()> {
        let upto = upto.min(self.writer.last_lsn());
        if self.writer.durable_lsn() >= upto {
            return Ok(());
        }

        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if self.writer.durable_lsn() >= upto {
                return Ok(());
            }
            self.writer.check_usable()?;

            if state.leader_active {
                if !waited {
                    self.stats.followers.fetch_add(1, Ordering::Relaxed);
                    waited = true;
                }
                self.batch_done.wait(&mut state);
                continue;
            }

            state.leader_active = true;
            let result = MutexGuard::unlocked(&mut state, || self.lead_batch());
            state.leader_active = false;
            self.batch_done.notify_all();
            result?;
        }
    }

    /// Runs one batch. Called without the batch lock held.
    fn lead_batch(&self) -> WalResult<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let outcome = self.writer.write_out().and_then(|(written, handle)| {
            if let (true, Some(file)) = (self.sync, handle) {
                let start = Instant::now();
                file.sync_data()?;
                self.stats
                    .sync_nanos
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                self.stats.syncs.fetch_add(1, Ordering::Relaxed);
            }
            Ok(written)
        });
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(written) => {
                self.writer.mark_durable(written);
                Ok(())
            }
            Err(err) => {
                let failure = self.writer.poison(err);
                tracing::error!(error = %failure, "WAL flush failed");
                Err(failure)
            }
        }
    }

    /// Forces an immediate flush of everything appended so far.
    pub fn flush_all(&self) -> WalResult<()> {
        self.flush(self.writer.last_lsn())
    }

    /// Returns the last durable LSN.
    pub fn synced_lsn(&self) -> Lsn {
        self.writer.durable_lsn()
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &GroupCommitStats {
        &self.stats
    }

    /// Returns true while a batch is being written.
    pub fn is_flushing(&self) -> bool {
        self.state.lock().leader_active
    }
}

impl std::fmt::Debug for GroupCommitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCommitManager")
            .field("synced_lsn", &self.synced_lsn())
            .field("delay", &self.delay)
            .field("sync", &self.sync)
            .field("batches", &self.stats.batches.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::error::WalError;
    use crate::record::{CommitPayload, WalPayload};
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;
    use txcore_common::types::{Timestamp, TxnId};

    fn writer(dir: &Path) -> Arc<WalWriter> {
        let config = Arc::new(WalConfig::new(dir).with_segment_size(1024 * 1024));
        Arc::new(WalWriter::new(config, Lsn::FIRST, 0))
    }

    fn commit(writer: &WalWriter, txn: u64) -> Lsn {
        writer
            .append(
                TxnId::new(txn),
                WalPayload::Commit(CommitPayload {
                    commit_timestamp: Timestamp::new(txn),
                }),
            )
            .unwrap()
    }

    #[test]
    fn test_group_commit_creation() {
        let tmp = TempDir::new().unwrap();
        let gc = GroupCommitManager::new(writer(tmp.path()), Duration::ZERO, true);

        assert_eq!(gc.synced_lsn(), Lsn::INVALID);
        assert!(!gc.is_flushing());
    }

    #[test]
    fn test_flush_makes_lsn_durable() {
        let tmp = TempDir::new().unwrap();
        let w = writer(tmp.path());
        let gc = GroupCommitManager::new(Arc::clone(&w), Duration::ZERO, true);

        let lsn = commit(&w, 1);
        gc.flush(lsn).unwrap();

        assert_eq!(gc.synced_lsn(), lsn);
        assert_eq!(gc.stats().syncs.load(Ordering::Relaxed), 1);

        // Already durable: no second batch.
        gc.flush(lsn).unwrap();
        assert_eq!(gc.stats().batches.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_flush_without_sync() {
        let tmp = TempDir::new().unwrap();
        let w = writer(tmp.path());
        let gc = GroupCommitManager::new(Arc::clone(&w), Duration::ZERO, false);

        let lsn = commit(&w, 1);
        gc.flush_all().unwrap();
        assert_eq!(w.written_lsn(), lsn);
        assert_eq!(gc.stats().syncs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_flushes_share_batches() {
        let tmp = TempDir::new().unwrap();
        let w = writer(tmp.path());
        let gc = Arc::new(GroupCommitManager::new(
            Arc::clone(&w),
            Duration::from_millis(5),
            true,
        ));

        let handles: Vec<_> = (1..=8)
            .map(|txn| {
                let w = Arc::clone(&w);
                let gc = Arc::clone(&gc);
                thread::spawn(move || {
                    let lsn = commit(&w, txn);
                    gc.flush(lsn).unwrap();
                    lsn
                })
            })
            .collect();

        let mut max = Lsn::INVALID;
        for handle in handles {
            let lsn = handle.join().unwrap();
            assert!(gc.synced_lsn() >= lsn);
            max = max.max(lsn);
        }

        assert_eq!(max, Lsn::new(8));
        assert!(gc.stats().batches.load(Ordering::Relaxed) <= 8);
    }

    #[test]
    fn test_failed_writer_fails_every_flush() {
        let tmp = TempDir::new().unwrap();
        let w = writer(tmp.path());
        let gc = GroupCommitManager::new(Arc::clone(&w), Duration::ZERO, true);

        let lsn = commit(&w, 1);
        w.poison(WalError::from(std::io::Error::new(
            std::io::ErrorKind::Other,
            "device lost",
        )));

        assert!(matches!(gc.flush(lsn), Err(WalError::FlushFailed { .. })));
        assert!(matches!(gc.flush(lsn), Err(WalError::FlushFailed { .. })));
    }
}
