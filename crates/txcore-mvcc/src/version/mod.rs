//! Version chain storage and management.
//!
//! This module implements MVCC version chains, which store multiple versions
//! of each row for snapshot reads. Each version is tagged with:
//! - Creating transaction and begin timestamp (its commit timestamp)
//! - Deleting transaction and end timestamp (the deleter's commit timestamp)
//! - A pointer to the previous (older) version of the same row
//!
//! # Version Chain Structure
//!
//! ```text
//! Row Key: (users, 1)
//! ┌─────────────────────────────────────────────────────┐
//! │ Version v7 (head)                                    │
//! │ created_by: 9, begin_ts: -, deleted_by: -            │
//! │ data: {name: "c"}                 (pending)          │
//! │                     ↓ prev                           │
//! │ Version v4                                           │
//! │ created_by: 5, begin_ts: 150, deleted_by: 9, end: -  │
//! │ data: {name: "b"}                                    │
//! │                     ↓ prev                           │
//! │ Version v1 (oldest)                                  │
//! │ created_by: 1, begin_ts: 50, deleted_by: 5, end: 150 │
//! │ data: {name: "a"}                                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Versions live in an arena addressed by [`VersionId`] (slot plus
//! generation), so a stale id can never alias a reclaimed slot. The index maps
//! each row key to the id of its newest version. Linking a new head and
//! reading a chain take the index shard lock before the arena lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use txcore_common::types::{IsolationLevel, RowKey, Timestamp, TxnId};

use crate::error::{MvccError, MvccResult};
use crate::snapshot::Snapshot;

/// A unique identifier for a version: arena slot plus slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VersionId {
    slot: usize,
    generation: u64,
}

impl VersionId {
    /// Returns the arena slot.
    pub const fn slot(self) -> usize {
        self.slot
    }

    /// Returns the slot generation.
    pub const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.slot, self.generation)
    }
}

/// The lifecycle state of a version, derived from its stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    /// Creator has not committed yet.
    Pending,
    /// Committed and current.
    Committed,
    /// Committed, with an uncommitted delete or update on top.
    PendingDelete,
    /// Superseded or deleted by a committed transaction; awaiting vacuum.
    Dead,
}

/// A single version of a row.
#[derive(Debug, Clone)]
pub struct Version {
    /// Unique identifier for this version.
    pub id: VersionId,
    /// Row this version belongs to.
    pub key: RowKey,
    /// The row payload.
    pub data: Bytes,
    /// Transaction that created this version.
    pub created_by: TxnId,
    /// Commit timestamp of the creator, `None` while uncommitted.
    pub begin_ts: Option<Timestamp>,
    /// Transaction that deleted or superseded this version.
    pub deleted_by: Option<TxnId>,
    /// Commit timestamp of the deleter, `None` while uncommitted.
    pub end_ts: Option<Timestamp>,
    /// Next older version of the same row.
    pub prev: Option<VersionId>,
}

impl Version {
    fn pending(
        id: VersionId,
        key: RowKey,
        created_by: TxnId,
        data: Bytes,
        prev: Option<VersionId>,
    ) -> Self {
        Self {
            id,
            key,
            data,
            created_by,
            begin_ts: None,
            deleted_by: None,
            end_ts: None,
            prev,
        }
    }

    /// Returns true once the creator has committed.
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.begin_ts.is_some()
    }

    /// Returns true once a committed transaction deleted or superseded it.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.end_ts.is_some()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> VersionState {
        match (self.begin_ts, self.deleted_by, self.end_ts) {
            (_, _, Some(_)) => VersionState::Dead,
            (None, _, None) => VersionState::Pending,
            (Some(_), Some(_), None) => VersionState::PendingDelete,
            (Some(_), None, None) => VersionState::Committed,
        }
    }

    /// Returns the approximate size of this version in bytes.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.data.len()
    }

    /// Returns true if vacuum may reclaim this version given the horizon.
    ///
    /// Every live snapshot has a timestamp at or above `horizon`, so a
    /// version deleted strictly before it is invisible to all of them.
    #[inline]
    pub fn can_reclaim(&self, horizon: Timestamp) -> bool {
        self.end_ts.is_some_and(|end| end < horizon)
    }

    /// Returns true if `txn` may put a new change on top of this version.
    fn check_writable(&self, txn: TxnId) -> MvccResult<()> {
        if self.begin_ts.is_none() && self.created_by != txn {
            return Err(MvccError::WriteConflict {
                key: self.key,
                holder: self.created_by,
            });
        }
        match self.deleted_by {
            Some(deleter) if self.end_ts.is_none() && deleter != txn => {
                Err(MvccError::WriteConflict {
                    key: self.key,
                    holder: deleter,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Kind of change a write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// New row (or re-insert over a deleted row).
    Insert,
    /// New version superseding a live one.
    Update,
    /// Live version marked deleted.
    Delete,
}

/// One entry of a transaction's write set.
///
/// The transaction manager keeps these in order; commit stamps them and
/// rollback undoes them newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEntry {
    /// Row written.
    pub key: RowKey,
    /// Kind of change.
    pub kind: WriteKind,
    /// Version created by the write.
    pub created: Option<VersionId>,
    /// Version whose `deleted_by` was set by the write.
    pub superseded: Option<VersionId>,
}

/// Per-version summary for status output.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    /// Version id.
    pub id: VersionId,
    /// Creating transaction.
    pub created_by: TxnId,
    /// Creator's commit timestamp.
    pub begin_ts: Option<Timestamp>,
    /// Deleting transaction.
    pub deleted_by: Option<TxnId>,
    /// Deleter's commit timestamp.
    pub end_ts: Option<Timestamp>,
    /// Payload length in bytes.
    pub data_len: usize,
    /// Lifecycle state.
    pub state: VersionState,
}

impl From<&Version> for VersionInfo {
    fn from(v: &Version) -> Self {
        Self {
            id: v.id,
            created_by: v.created_by,
            begin_ts: v.begin_ts,
            deleted_by: v.deleted_by,
            end_ts: v.end_ts,
            data_len: v.data.len(),
            state: v.state(),
        }
    }
}

/// Outcome of one vacuum sweep over the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Chains inspected.
    pub chains_scanned: usize,
    /// Versions freed.
    pub versions_reclaimed: usize,
    /// Keys removed from the index because nothing was left.
    pub chains_pruned: usize,
}

struct Slot {
    generation: u64,
    version: Option<Version>,
}

/// Slab of versions with generation-checked ids.
#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    bytes: usize,
}

impl Arena {
    fn insert(&mut self, build: impl FnOnce(VersionId) -> Version) -> VersionId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    version: None,
                });
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        let id = VersionId {
            slot,
            generation: entry.generation,
        };
        let version = build(id);
        self.live += 1;
        self.bytes += version.size();
        entry.version = Some(version);
        id
    }

    fn get(&self, id: VersionId) -> Option<&Version> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.version.as_ref())
    }

    fn get_mut(&mut self, id: VersionId) -> Option<&mut Version> {
        self.slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.version.as_mut())
    }

    fn remove(&mut self, id: VersionId) -> Option<Version> {
        let slot = self.slots.get_mut(id.slot)?;
        if slot.generation != id.generation {
            return None;
        }
        let version = slot.version.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
        self.live -= 1;
        self.bytes -= version.size();
        Some(version)
    }
}

/// Point-in-time counters of the version store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionStoreStats {
    /// Rows with at least one version.
    pub keys: usize,
    /// Versions currently stored.
    pub live_versions: usize,
    /// Stored versions already deleted or superseded by a commit.
    pub dead_versions: u64,
    /// Approximate bytes held by stored versions.
    pub bytes: usize,
    /// Versions created since start.
    pub total_created: u64,
    /// Versions reclaimed by vacuum since start.
    pub total_reclaimed: u64,
}

/// A store for managing version chains.
pub struct VersionStore {
    /// Newest version of every row.
    heads: DashMap<RowKey, VersionId>,
    /// Version records.
    arena: RwLock<Arena>,
    created: AtomicU64,
    dead: AtomicU64,
    reclaimed: AtomicU64,
}

impl VersionStore {
    /// Creates a new empty version store.
    pub fn new() -> Self {
        Self {
            heads: DashMap::new(),
            arena: RwLock::new(Arena::default()),
            created: AtomicU64::new(0),
            dead: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Returns the number of rows in the store.
    pub fn key_count(&self) -> usize {
        self.heads.len()
    }

    /// Returns the number of stored versions.
    pub fn version_count(&self) -> usize {
        self.arena.read().live
    }

    /// Links a new pending version of `key` created by `txn`.
    ///
    /// Fails with [`MvccError::WriteConflict`] if another transaction has an
    /// uncommitted change on the row. Callers serialise writers of the same
    /// row with an exclusive row lock, so the conflict is never expected on
    /// that path.
    pub fn write(&self, key: RowKey, txn: TxnId, data: Bytes) -> MvccResult<WriteEntry> {
        let entry = match self.heads.entry(key) {
            Entry::Vacant(vacant) => {
                let id = self
                    .arena
                    .write()
                    .insert(|id| Version::pending(id, key, txn, data, None));
                vacant.insert(id);
                WriteEntry {
                    key,
                    kind: WriteKind::Insert,
                    created: Some(id),
                    superseded: None,
                }
            }
            Entry::Occupied(mut occupied) => {
                let head_id = *occupied.get();
                let mut arena = self.arena.write();
                let superseded = {
                    let head = arena
                        .get_mut(head_id)
                        .ok_or(MvccError::VersionNotFound(head_id))?;
                    head.check_writable(txn)?;
                    if head.deleted_by.is_none() {
                        head.deleted_by = Some(txn);
                        Some(head_id)
                    } else {
                        None
                    }
                };
                let id = arena.insert(|id| Version::pending(id, key, txn, data, Some(head_id)));
                occupied.insert(id);
                WriteEntry {
                    key,
                    kind: if superseded.is_some() {
                        WriteKind::Update
                    } else {
                        WriteKind::Insert
                    },
                    created: Some(id),
                    superseded,
                }
            }
        };
        self.created.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(entry)
    }

    /// Marks the newest version of `key` as deleted by `txn`.
    ///
    /// Returns `None` if the row does not exist or is already deleted.
    pub fn delete(&self, key: RowKey, txn: TxnId) -> MvccResult<Option<WriteEntry>> {
        let Some(head) = self.heads.get(&key) else {
            return Ok(None);
        };
        let head_id = *head;
        let mut arena = self.arena.write();
        let version = arena
            .get_mut(head_id)
            .ok_or(MvccError::VersionNotFound(head_id))?;
        version.check_writable(txn)?;
        if version.deleted_by.is_some() {
            return Ok(None);
        }
        version.deleted_by = Some(txn);
        Ok(Some(WriteEntry {
            key,
            kind: WriteKind::Delete,
            created: None,
            superseded: Some(head_id),
        }))
    }

    /// Reads the payload of `key` visible to `snapshot`.
    pub fn read(&self, key: &RowKey, snapshot: &Snapshot) -> Option<Bytes> {
        self.with_visible(key, snapshot, |v| v.data.clone())
    }

    /// Returns a copy of the version of `key` visible to `snapshot`.
    pub fn visible_version(&self, key: &RowKey, snapshot: &Snapshot) -> Option<Version> {
        self.with_visible(key, snapshot, Version::clone)
    }

    fn with_visible<R>(
        &self,
        key: &RowKey,
        snapshot: &Snapshot,
        f: impl FnOnce(&Version) -> R,
    ) -> Option<R> {
        let head = self.heads.get(key)?;
        let arena = self.arena.read();

        if snapshot.isolation() == IsolationLevel::ReadUncommitted {
            // Dirty read: aborted versions are unlinked eagerly, so the head
            // is the newest non-aborted state of the row.
            let version = arena.get(*head)?;
            return version.deleted_by.is_none().then(|| f(version));
        }

        let mut cursor = Some(*head);
        while let Some(id) = cursor {
            let version = arena.get(id)?;
            if snapshot.is_visible(version) {
                return Some(f(version));
            }
            cursor = version.prev;
        }
        None
    }

    /// Stamps every entry of a write set with the commit timestamp.
    pub fn commit(&self, writes: &[WriteEntry], commit_ts: Timestamp) {
        let mut arena = self.arena.write();
        let mut dead = 0u64;
        for write in writes {
            if let Some(version) = write.created.and_then(|id| arena.get_mut(id)) {
                version.begin_ts = Some(commit_ts);
            }
            if let Some(version) = write.superseded.and_then(|id| arena.get_mut(id)) {
                version.end_ts = Some(commit_ts);
                dead += 1;
            }
        }
        self.dead.fetch_add(dead, AtomicOrdering::Relaxed);
    }

    /// Undoes the entries of a write set, newest first.
    ///
    /// Used for abort and for rollback to a savepoint. Created versions are
    /// unlinked and freed; superseded versions get their deleter cleared.
    pub fn rollback(&self, writes: &[WriteEntry]) {
        for write in writes.iter().rev() {
            if let Some(id) = write.created {
                self.unlink_head(write.key, id);
            }
            if let Some(id) = write.superseded {
                let mut arena = self.arena.write();
                if let Some(version) = arena.get_mut(id) {
                    if version.end_ts.is_none() {
                        version.deleted_by = None;
                    }
                }
            }
        }
    }

    fn unlink_head(&self, key: RowKey, id: VersionId) {
        match self.heads.entry(key) {
            Entry::Occupied(mut occupied) if *occupied.get() == id => {
                let prev = self.arena.write().remove(id).and_then(|v| v.prev);
                match prev {
                    Some(prev) => {
                        occupied.insert(prev);
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            _ => {
                tracing::warn!(%key, version = %id, "rolled back version is not the chain head");
            }
        }
    }

    /// Reclaims versions deleted before `horizon`, visiting at most enough
    /// chains to free `limit` versions.
    ///
    /// A chain is ordered newest first and end timestamps decrease along it,
    /// so the first reclaimable version found cuts the chain: it and every
    /// older version are freed together.
    pub fn sweep(&self, horizon: Timestamp, limit: usize) -> SweepOutcome {
        let keys: Vec<RowKey> = self.heads.iter().map(|e| *e.key()).collect();
        let mut outcome = SweepOutcome::default();

        for key in keys {
            if outcome.versions_reclaimed >= limit {
                break;
            }
            let Entry::Occupied(occupied) = self.heads.entry(key) else {
                continue;
            };
            outcome.chains_scanned += 1;

            let mut arena = self.arena.write();
            let mut newer = None;
            let mut cut = None;
            let mut cursor = Some(*occupied.get());
            while let Some(id) = cursor {
                let Some(version) = arena.get(id) else { break };
                if version.can_reclaim(horizon) {
                    cut = Some(id);
                    break;
                }
                newer = Some(id);
                cursor = version.prev;
            }

            let Some(first) = cut else { continue };
            match newer.and_then(|id| arena.get_mut(id)) {
                Some(version) => version.prev = None,
                None => {
                    occupied.remove();
                    outcome.chains_pruned += 1;
                }
            }

            let mut cursor = Some(first);
            while let Some(id) = cursor {
                cursor = arena.remove(id).and_then(|v| v.prev);
                outcome.versions_reclaimed += 1;
            }
        }

        let reclaimed = outcome.versions_reclaimed as u64;
        self.dead.fetch_sub(reclaimed, AtomicOrdering::Relaxed);
        self.reclaimed.fetch_add(reclaimed, AtomicOrdering::Relaxed);
        outcome
    }

    /// Returns every stored version of `key`, newest first.
    pub fn row_versions(&self, key: &RowKey) -> Vec<VersionInfo> {
        let Some(head) = self.heads.get(key) else {
            return Vec::new();
        };
        let arena = self.arena.read();
        let mut out = Vec::new();
        let mut cursor = Some(*head);
        while let Some(version) = cursor.and_then(|id| arena.get(id)) {
            out.push(VersionInfo::from(version));
            cursor = version.prev;
        }
        out
    }

    /// Returns a snapshot of the store counters.
    pub fn stats(&self) -> VersionStoreStats {
        let (live_versions, bytes) = {
            let arena = self.arena.read();
            (arena.live, arena.bytes)
        };
        VersionStoreStats {
            keys: self.heads.len(),
            live_versions,
            dead_versions: self.dead.load(AtomicOrdering::Relaxed),
            bytes,
            total_created: self.created.load(AtomicOrdering::Relaxed),
            total_reclaimed: self.reclaimed.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionStore")
            .field("stats", &self.stats())
            .finish()
    }
}
