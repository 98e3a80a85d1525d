//! Durable on-disk fallback storage.
//!
//! One JSON document per entity type under the configured directory. The
//! document carries the record set *and* the modified/deleted sets, so a
//! process restart during an outage still knows what is owed to the
//! backing store. Records are stamped with storage/update timestamps used
//! by retention cleanup; the stamps never leave this module.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cache::TableCounts;
use crate::error::{GriddleError, Result};
use crate::types::{EntityKind, Record};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    stored_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    record: serde_json::Value,
}

/// On-disk shape of one entity type's document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FallbackDocument {
    records: HashMap<i64, StoredRecord>,
    modified: Vec<i64>,
    deleted: Vec<i64>,
}

#[derive(Default)]
struct FallbackTable {
    rows: HashMap<i64, StoredRecord>,
    modified: HashSet<i64>,
    deleted: HashSet<i64>,
    /// The on-disk document no longer matches memory.
    doc_dirty: bool,
}

struct FallbackState {
    tables: [FallbackTable; EntityKind::COUNT],
    last_persist: Instant,
}

/// A pending operation replayed toward the backing store.
#[derive(Debug, Clone)]
pub enum ReplayOp {
    Upsert(Record),
    Delete(EntityKind, i64),
}

/// Attempted vs succeeded counts for one replay pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTally {
    pub attempted: usize,
    pub succeeded: usize,
}

impl SyncTally {
    pub fn is_clean(&self) -> bool {
        self.attempted == self.succeeded
    }
}

pub struct FallbackStorage {
    dir: PathBuf,
    persist_interval: Duration,
    state: Mutex<FallbackState>,
}

impl FallbackStorage {
    /// Open the storage directory and load whatever documents exist. A
    /// corrupt document is logged and skipped, so that type starts empty
    /// rather than failing the whole load.
    pub fn open(dir: &Path, persist_interval: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut tables: [FallbackTable; EntityKind::COUNT] =
            std::array::from_fn(|_| FallbackTable::default());

        for kind in EntityKind::ALL {
            let path = Self::document_path(dir, kind);
            if !path.exists() {
                continue;
            }
            match Self::load_document(&path, kind) {
                Ok(doc) => {
                    let table = &mut tables[kind.index()];
                    table.rows = doc.records;
                    table.modified = doc.modified.into_iter().collect();
                    table.deleted = doc.deleted.into_iter().collect();
                    tracing::info!(
                        "[FALLBACK] loaded {} ({} records, {} modified, {} deleted)",
                        kind.table(),
                        table.rows.len(),
                        table.modified.len(),
                        table.deleted.len()
                    );
                }
                Err(e) => {
                    tracing::error!("[FALLBACK] skipping {}: {}", kind.table(), e);
                }
            }
        }

        Ok(FallbackStorage {
            dir: dir.to_path_buf(),
            persist_interval,
            state: Mutex::new(FallbackState {
                tables,
                last_persist: Instant::now(),
            }),
        })
    }

    fn document_path(dir: &Path, kind: EntityKind) -> PathBuf {
        dir.join(format!("{}.json", kind.table()))
    }

    fn load_document(path: &Path, kind: EntityKind) -> Result<FallbackDocument> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| GriddleError::CorruptDocument {
            table: kind.table(),
            message: e.to_string(),
        })
    }

    /// Stamp and store a record. An overwrite keeps the original storage
    /// stamp so the retention clock keeps running; only the update stamp
    /// refreshes. Clears a prior tombstone for the id, mirroring the cache
    /// invariant.
    pub fn add_item(&self, record: &Record) -> Result<()> {
        let now = Utc::now();
        let payload = record.to_payload()?;
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[record.kind().index()];
        match table.rows.get_mut(&record.id()) {
            Some(stored) => {
                stored.record = payload;
                stored.updated_at = now;
            }
            None => {
                table.rows.insert(
                    record.id(),
                    StoredRecord {
                        stored_at: now,
                        updated_at: now,
                        record: payload,
                    },
                );
            }
        }
        table.modified.insert(record.id());
        table.deleted.remove(&record.id());
        table.doc_dirty = true;
        Ok(())
    }

    /// Record with the internal stamps stripped.
    pub fn get_item(&self, kind: EntityKind, id: i64) -> Option<Record> {
        let state = self.state.lock().unwrap();
        let stored = state.tables[kind.index()].rows.get(&id)?;
        match Record::from_payload(kind, stored.record.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!("[FALLBACK] undecodable {} record {}: {}", kind.table(), id, e);
                None
            }
        }
    }

    pub fn get_all_items(&self, kind: EntityKind) -> Vec<Record> {
        let state = self.state.lock().unwrap();
        state.tables[kind.index()]
            .rows
            .iter()
            .filter_map(
                |(id, stored)| match Record::from_payload(kind, stored.record.clone()) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::error!(
                            "[FALLBACK] undecodable {} record {}: {}",
                            kind.table(),
                            id,
                            e
                        );
                        None
                    }
                },
            )
            .collect()
    }

    /// Field-level merge preserving the original storage stamp; only the
    /// update stamp is refreshed.
    pub fn update_item(
        &self,
        kind: EntityKind,
        id: i64,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        let Some(stored) = table.rows.get_mut(&id) else {
            return Ok(false);
        };
        let mut record = Record::from_payload(kind, stored.record.clone())?;
        record.merge(patch)?;
        stored.record = record.to_payload()?;
        stored.updated_at = Utc::now();
        table.modified.insert(id);
        table.deleted.remove(&id);
        table.doc_dirty = true;
        Ok(true)
    }

    /// Remove a stored record and tombstone it. False when absent; use
    /// [`FallbackStorage::mark_deleted`] when the tombstone must be kept
    /// regardless.
    pub fn delete_item(&self, kind: EntityKind, id: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        if table.rows.remove(&id).is_none() {
            return false;
        }
        table.deleted.insert(id);
        table.modified.remove(&id);
        table.doc_dirty = true;
        true
    }

    /// Unconditional tombstone. The id may never have been copied into
    /// fallback storage; the delete is still owed to the backing store and
    /// must survive a restart.
    pub fn mark_deleted(&self, kind: EntityKind, id: i64) {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        table.rows.remove(&id);
        table.deleted.insert(id);
        table.modified.remove(&id);
        table.doc_dirty = true;
    }

    /// Drop the stored copies and flags for ids whose newer value was just
    /// confirmed in the backing store. The disk copy is stale from that
    /// moment on; keeping it would let a later replay overwrite the
    /// confirmed value.
    pub fn discard_superseded(&self, kind: EntityKind, upserted: &[Record], deleted_ids: &[i64]) {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        let mut touched = false;
        let ids = upserted
            .iter()
            .map(Record::id)
            .chain(deleted_ids.iter().copied());
        for id in ids {
            touched |= table.rows.remove(&id).is_some();
            touched |= table.modified.remove(&id);
            touched |= table.deleted.remove(&id);
        }
        if touched {
            table.doc_dirty = true;
        }
    }

    pub fn has_pending(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .tables
            .iter()
            .any(|t| !t.modified.is_empty() || !t.deleted.is_empty())
    }

    pub fn counts(&self, kind: EntityKind) -> TableCounts {
        let state = self.state.lock().unwrap();
        let table = &state.tables[kind.index()];
        TableCounts {
            live: table.rows.len(),
            modified: table.modified.len(),
            deleted: table.deleted.len(),
        }
    }

    /// Interval-gated persist: a no-op until `persist_interval` has passed
    /// since the last write-out, bounding write amplification.
    pub fn auto_persist(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.last_persist.elapsed() < self.persist_interval {
                return Ok(());
            }
        }
        self.persist_dirty()
    }

    /// Write every stale document to disk now. Serialization happens under
    /// the guard; file writes happen after it is released.
    pub fn persist_dirty(&self) -> Result<()> {
        let pending: Vec<(EntityKind, String)> = {
            let mut state = self.state.lock().unwrap();
            state.last_persist = Instant::now();
            let mut out = Vec::new();
            for kind in EntityKind::ALL {
                let table = &mut state.tables[kind.index()];
                if !table.doc_dirty {
                    continue;
                }
                let doc = FallbackDocument {
                    records: table.rows.clone(),
                    modified: table.modified.iter().copied().collect(),
                    deleted: table.deleted.iter().copied().collect(),
                };
                out.push((kind, serde_json::to_string_pretty(&doc)?));
                table.doc_dirty = false;
            }
            out
        };

        for (kind, json) in pending {
            if let Err(e) = self.write_document(kind, &json) {
                tracing::error!("[FALLBACK] persist of {} failed: {}", kind.table(), e);
                let mut state = self.state.lock().unwrap();
                state.tables[kind.index()].doc_dirty = true;
                return Err(e);
            }
            tracing::debug!("[FALLBACK] persisted {}", kind.table());
        }
        Ok(())
    }

    /// Atomic replace: write to a temp file in the same directory, then
    /// rename over the document so a crash never leaves a half-written file.
    fn write_document(&self, kind: EntityKind, json: &str) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::io::Write::write_all(&mut tmp, json.as_bytes())?;
        tmp.persist(Self::document_path(&self.dir, kind))
            .map_err(|e| GriddleError::Io(e.to_string()))?;
        Ok(())
    }

    /// Whether the storage directory currently accepts writes. Used by the
    /// health surface to distinguish degraded from unhealthy.
    pub fn probe_writable(&self) -> bool {
        tempfile::NamedTempFile::new_in(&self.dir).is_ok()
    }

    /// Drop records whose storage stamp is older than the retention
    /// threshold and re-persist the affected documents. Returns the number
    /// of records removed.
    pub fn cleanup_old_data(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let mut removed = 0usize;
        {
            let mut state = self.state.lock().unwrap();
            for kind in EntityKind::ALL {
                let table = &mut state.tables[kind.index()];
                let expired: Vec<i64> = table
                    .rows
                    .iter()
                    .filter(|(_, stored)| stored.stored_at < cutoff)
                    .map(|(id, _)| *id)
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                for id in &expired {
                    table.rows.remove(id);
                    table.modified.remove(id);
                }
                table.doc_dirty = true;
                removed += expired.len();
                tracing::info!(
                    "[FALLBACK] retention removed {} {} records",
                    expired.len(),
                    kind.table()
                );
            }
        }
        if removed > 0 {
            self.persist_dirty()?;
        }
        Ok(removed)
    }

    /// Replay every pending tombstone and modified record through
    /// `persist`: all tombstones first in delete order, then all records in
    /// the reverse order, the same sequencing the direct sync path uses so
    /// a parent row always lands before anything referencing it. A type's
    /// flags are cleared only when every one of its operations succeeded;
    /// partial types keep their remaining flags for the next attempt.
    pub async fn sync_to_database<F, Fut>(&self, mut persist: F) -> Result<SyncTally>
    where
        F: FnMut(ReplayOp) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut tally = SyncTally::default();

        let pending: Vec<(EntityKind, Vec<Record>, Vec<i64>)> = {
            let state = self.state.lock().unwrap();
            EntityKind::DELETE_ORDER
                .into_iter()
                .map(|kind| {
                    let table = &state.tables[kind.index()];
                    let upserts: Vec<Record> = table
                        .modified
                        .iter()
                        .filter_map(|id| {
                            let stored = table.rows.get(id)?;
                            Record::from_payload(kind, stored.record.clone()).ok()
                        })
                        .collect();
                    let deletes: Vec<i64> = table.deleted.iter().copied().collect();
                    (kind, upserts, deletes)
                })
                .collect()
        };

        let mut synced_upserts: [Vec<i64>; EntityKind::COUNT] = std::array::from_fn(|_| Vec::new());
        let mut synced_deletes: [Vec<i64>; EntityKind::COUNT] = std::array::from_fn(|_| Vec::new());

        for (kind, _, deletes) in &pending {
            for id in deletes {
                tally.attempted += 1;
                match persist(ReplayOp::Delete(*kind, *id)).await {
                    Ok(()) => {
                        tally.succeeded += 1;
                        synced_deletes[kind.index()].push(*id);
                    }
                    Err(e) => {
                        tracing::warn!("[FALLBACK] replay delete {} {}: {}", kind.table(), id, e)
                    }
                }
            }
        }
        for (kind, upserts, _) in pending.iter().rev() {
            for record in upserts {
                tally.attempted += 1;
                match persist(ReplayOp::Upsert(record.clone())).await {
                    Ok(()) => {
                        tally.succeeded += 1;
                        synced_upserts[kind.index()].push(record.id());
                    }
                    Err(e) => tracing::warn!(
                        "[FALLBACK] replay upsert {} {}: {}",
                        kind.table(),
                        record.id(),
                        e
                    ),
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            for (kind, upserts, deletes) in &pending {
                if upserts.is_empty() && deletes.is_empty() {
                    continue;
                }
                let clean_sweep = synced_upserts[kind.index()].len() == upserts.len()
                    && synced_deletes[kind.index()].len() == deletes.len();
                if !clean_sweep {
                    continue;
                }
                let table = &mut state.tables[kind.index()];
                for id in &synced_upserts[kind.index()] {
                    table.modified.remove(id);
                }
                for id in &synced_deletes[kind.index()] {
                    table.deleted.remove(id);
                }
                table.doc_dirty = true;
            }
        }

        tracing::info!(
            "[FALLBACK] replay complete: {}/{} succeeded",
            tally.succeeded,
            tally.attempted
        );
        if tally.attempted > 0 {
            self.persist_dirty()?;
        }
        Ok(tally)
    }

    #[cfg(test)]
    fn backdate(&self, kind: EntityKind, id: i64, days: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.tables[kind.index()].rows.get_mut(&id) {
            stored.stored_at = Utc::now() - ChronoDuration::days(days);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChapterComment, Story, User};
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FallbackStorage {
        FallbackStorage::open(dir.path(), Duration::from_secs(300)).unwrap()
    }

    fn story(id: i64, title: &str) -> Record {
        Record::Story(Story::new(id, title, "body", 7))
    }

    #[test]
    fn stamps_are_stripped_on_the_way_out() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let record = story(1, "T");
        storage.add_item(&record).unwrap();
        let out = storage.get_item(EntityKind::Story, 1).unwrap();
        assert_eq!(out, record);
        assert!(out.to_payload().unwrap().get("stored_at").is_none());
    }

    #[test]
    fn update_preserves_storage_stamp_and_merges() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        storage.add_item(&story(1, "old")).unwrap();
        let before = {
            let state = storage.state.lock().unwrap();
            state.tables[EntityKind::Story.index()].rows[&1].stored_at
        };
        assert!(storage
            .update_item(
                EntityKind::Story,
                1,
                json!({"title": "new"}).as_object().unwrap()
            )
            .unwrap());
        let state = storage.state.lock().unwrap();
        let stored = &state.tables[EntityKind::Story.index()].rows[&1];
        assert_eq!(stored.stored_at, before);
        assert_eq!(stored.record["title"], json!("new"));
        assert_eq!(stored.record["content"], json!("body"));
    }

    #[test]
    fn re_adding_a_record_keeps_the_storage_stamp() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        storage.add_item(&story(1, "first")).unwrap();
        let before = {
            let state = storage.state.lock().unwrap();
            state.tables[EntityKind::Story.index()].rows[&1].stored_at
        };
        storage.add_item(&story(1, "second")).unwrap();
        let state = storage.state.lock().unwrap();
        let stored = &state.tables[EntityKind::Story.index()].rows[&1];
        assert_eq!(stored.stored_at, before, "retention clock must not reset");
        assert_eq!(stored.record["title"], json!("second"));
    }

    #[test]
    fn discard_superseded_drops_rows_and_flags() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        storage.add_item(&story(1, "stale")).unwrap();
        storage.mark_deleted(EntityKind::Story, 2);

        storage.discard_superseded(EntityKind::Story, &[story(1, "newer")], &[2]);
        assert!(!storage.has_pending());
        assert!(storage.get_item(EntityKind::Story, 1).is_none());
    }

    #[test]
    fn documents_survive_reopen_including_flags() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open(&dir);
            storage.add_item(&story(1, "T")).unwrap();
            storage.mark_deleted(EntityKind::Story, 9);
            storage.persist_dirty().unwrap();
        }
        let storage = open(&dir);
        assert!(storage.get_item(EntityKind::Story, 1).is_some());
        let counts = storage.counts(EntityKind::Story);
        assert_eq!(counts.modified, 1);
        assert_eq!(counts.deleted, 1);
        assert!(storage.has_pending());
    }

    #[test]
    fn corrupt_document_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stories.json"), "{not json").unwrap();
        {
            let storage = open(&dir);
            let counts = storage.counts(EntityKind::Story);
            assert_eq!(counts.live, 0);
            // Other types are unaffected.
            storage.add_item(&story(2, "ok")).unwrap();
        }
    }

    #[test]
    fn mark_deleted_records_tombstone_for_unknown_id() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        assert!(!storage.delete_item(EntityKind::Story, 5));
        storage.mark_deleted(EntityKind::Story, 5);
        assert_eq!(storage.counts(EntityKind::Story).deleted, 1);
    }

    #[test]
    fn auto_persist_respects_interval() {
        let dir = TempDir::new().unwrap();
        let storage = FallbackStorage::open(dir.path(), Duration::from_secs(3600)).unwrap();
        storage.add_item(&story(1, "T")).unwrap();
        storage.auto_persist().unwrap();
        assert!(
            !dir.path().join("stories.json").exists(),
            "interval not elapsed, nothing written"
        );
        storage.persist_dirty().unwrap();
        assert!(dir.path().join("stories.json").exists());
    }

    #[test]
    fn retention_cleanup_drops_old_records_and_repersists() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        storage.add_item(&story(1, "old")).unwrap();
        storage.add_item(&story(2, "fresh")).unwrap();
        storage.backdate(EntityKind::Story, 1, 30);

        let removed = storage.cleanup_old_data(7).unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_item(EntityKind::Story, 1).is_none());
        assert!(storage.get_item(EntityKind::Story, 2).is_some());
        assert!(dir.path().join("stories.json").exists());
    }

    #[tokio::test]
    async fn replay_deletes_leaf_first_and_upserts_parents_first() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        storage
            .add_item(&Record::User(User::new(1, "ann", "ann@example.com", "hash")))
            .unwrap();
        storage.add_item(&story(1, "T")).unwrap();
        storage
            .add_item(&Record::ChapterComment(ChapterComment::new(
                1, 1, "nice", "bob", 2,
            )))
            .unwrap();
        storage.mark_deleted(EntityKind::ChapterComment, 9);
        storage.mark_deleted(EntityKind::Story, 9);

        let log = std::sync::Arc::new(Mutex::new(Vec::new()));
        let tally = storage
            .sync_to_database(|op| {
                let log = log.clone();
                async move {
                    let line = match &op {
                        ReplayOp::Upsert(r) => format!("upsert {}", r.kind().table()),
                        ReplayOp::Delete(kind, _) => format!("delete {}", kind.table()),
                    };
                    log.lock().unwrap().push(line);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert!(tally.is_clean());

        let ops = log.lock().unwrap().clone();
        let pos = |needle: &str| ops.iter().position(|o| o == needle).unwrap();
        assert!(pos("delete chapter_comments") < pos("delete stories"));
        // Every tombstone lands before any record.
        assert!(pos("delete stories") < pos("upsert users"));
        assert!(pos("upsert users") < pos("upsert stories"));
        assert!(pos("upsert stories") < pos("upsert chapter_comments"));
    }

    #[tokio::test]
    async fn replay_clears_flags_only_on_clean_sweep() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        storage.add_item(&story(1, "a")).unwrap();
        storage.add_item(&story(2, "b")).unwrap();

        // First pass: record 2 fails, flags must survive for it.
        let tally = storage
            .sync_to_database(|op| async move {
                match op {
                    ReplayOp::Upsert(r) if r.id() == 2 => {
                        Err(GriddleError::Connectivity("down".into()))
                    }
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();
        assert_eq!(tally.attempted, 2);
        assert_eq!(tally.succeeded, 1);
        assert!(!tally.is_clean());
        assert_eq!(storage.counts(EntityKind::Story).modified, 2);

        // Second pass succeeds and clears.
        let tally = storage
            .sync_to_database(|_| async move { Ok(()) })
            .await
            .unwrap();
        assert!(tally.is_clean());
        assert_eq!(storage.counts(EntityKind::Story).modified, 0);
        assert!(!storage.has_pending());
    }
}
