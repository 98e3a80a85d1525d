//! Write-back in-memory store.
//!
//! All foreground reads and writes land here and return immediately; the
//! reconciler drains the per-type modified/deleted sets in the background.
//! One mutex covers every table, flag set, id counter, and the rate-limit
//! map, and no operation performs I/O while holding it.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::types::{EntityKind, Record};

#[derive(Default)]
struct Table {
    rows: HashMap<i64, Record>,
    modified: HashSet<i64>,
    deleted: HashSet<i64>,
    next_id: i64,
}

impl Table {
    /// No id may carry both a pending-write and a tombstone flag. A
    /// violation here is a programming defect in the mutation paths, so it
    /// trips loudly under test builds.
    fn assert_flags_disjoint(&self) {
        debug_assert!(
            self.modified.is_disjoint(&self.deleted),
            "id flagged both modified and deleted"
        );
    }
}

struct CacheState {
    tables: [Table; EntityKind::COUNT],
    ip_register_times: HashMap<IpAddr, Instant>,
}

/// Pending changes for one entity type, captured under the cache guard.
#[derive(Debug, Clone)]
pub struct DirtyBatch {
    pub kind: EntityKind,
    pub upserts: Vec<Record>,
    pub deletes: Vec<i64>,
}

/// Snapshot of all dirty state, in delete-safe order.
#[derive(Debug, Clone, Default)]
pub struct DirtySnapshot {
    pub batches: Vec<DirtyBatch>,
}

impl DirtySnapshot {
    pub fn is_empty(&self) -> bool {
        self.batches
            .iter()
            .all(|b| b.upserts.is_empty() && b.deletes.is_empty())
    }
}

/// Per-type sizes for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TableCounts {
    pub live: usize,
    pub modified: usize,
    pub deleted: usize,
}

pub struct Cache {
    state: Mutex<CacheState>,
    rate_limit_window: Duration,
}

impl Cache {
    pub fn new(rate_limit_window: Duration) -> Self {
        Cache {
            state: Mutex::new(CacheState {
                tables: std::array::from_fn(|_| Table::default()),
                ip_register_times: HashMap::new(),
            }),
            rate_limit_window,
        }
    }

    pub fn get(&self, kind: EntityKind, id: i64) -> Option<Record> {
        let state = self.state.lock().unwrap();
        state.tables[kind.index()].rows.get(&id).cloned()
    }

    /// All live records of a type, in unspecified order.
    pub fn get_all(&self, kind: EntityKind) -> Vec<Record> {
        let state = self.state.lock().unwrap();
        state.tables[kind.index()].rows.values().cloned().collect()
    }

    /// Insert a record, overwriting any id collision. An id of zero or
    /// less requests allocation from the per-type counter (max seen + 1,
    /// never reused). Returns the effective id.
    ///
    /// Marks the id modified and clears any prior tombstone.
    pub fn add(&self, mut record: Record) -> i64 {
        let kind = record.kind();
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        if record.id() <= 0 {
            record.set_id(table.next_id.max(1));
        }
        let id = record.id();
        table.next_id = table.next_id.max(id + 1);
        table.rows.insert(id, record);
        table.modified.insert(id);
        table.deleted.remove(&id);
        table.assert_flags_disjoint();
        id
    }

    /// Field-level merge into an existing record. Returns `Ok(false)` when
    /// the id is absent; a malformed patch errors without touching state.
    pub fn update(
        &self,
        kind: EntityKind,
        id: i64,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        let Some(record) = table.rows.get_mut(&id) else {
            return Ok(false);
        };
        record.merge(patch)?;
        table.modified.insert(id);
        table.deleted.remove(&id);
        table.assert_flags_disjoint();
        Ok(true)
    }

    /// Tombstone a record: removed from the live map and flagged deleted in
    /// the same critical section. Returns false when the id was absent.
    pub fn delete(&self, kind: EntityKind, id: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        if table.rows.remove(&id).is_none() {
            return false;
        }
        table.deleted.insert(id);
        table.modified.remove(&id);
        table.assert_flags_disjoint();
        true
    }

    /// Bulk-load a backing-store snapshot without dirtying anything. The
    /// id counter advances past the loaded ids.
    pub fn load_records(&self, kind: EntityKind, records: Vec<Record>) {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        for record in records {
            let id = record.id();
            table.next_id = table.next_id.max(id + 1);
            table.rows.insert(id, record);
        }
    }

    /// Sliding-window rate limit: an address passes at most once per
    /// window. Expired entries are purged lazily on each call, and the
    /// check-then-record pair happens under the one cache guard.
    pub fn check_and_register_rate_limit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let window = self.rate_limit_window;
        let mut state = self.state.lock().unwrap();
        state
            .ip_register_times
            .retain(|_, registered| now.duration_since(*registered) <= window);
        if state.ip_register_times.contains_key(&ip) {
            return false;
        }
        state.ip_register_times.insert(ip, now);
        true
    }

    /// Clone all dirty ids and their current record values, in
    /// [`EntityKind::DELETE_ORDER`]. Flags are left untouched; the
    /// reconciler clears them via [`Cache::clear_synced`] once a batch is
    /// confirmed durable.
    pub fn snapshot_dirty(&self) -> DirtySnapshot {
        let state = self.state.lock().unwrap();
        let batches = EntityKind::DELETE_ORDER
            .into_iter()
            .map(|kind| {
                let table = &state.tables[kind.index()];
                let upserts = table
                    .modified
                    .iter()
                    .filter_map(|id| table.rows.get(id).cloned())
                    .collect();
                let mut deletes: Vec<i64> = table.deleted.iter().copied().collect();
                deletes.sort_unstable();
                DirtyBatch {
                    kind,
                    upserts,
                    deletes,
                }
            })
            .collect();
        DirtySnapshot { batches }
    }

    /// Drop flags for items confirmed persisted. A modified flag is only
    /// cleared while the live record still equals the synced value, so a
    /// write racing in after the snapshot keeps its flag for the next pass.
    pub fn clear_synced(&self, kind: EntityKind, synced: &[Record], deleted_ids: &[i64]) {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.tables[kind.index()];
        for record in synced {
            if table.rows.get(&record.id()) == Some(record) {
                table.modified.remove(&record.id());
            }
        }
        for id in deleted_ids {
            table.deleted.remove(id);
        }
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

    /// Dirty ids for one type, for tests and the health surface.
    pub fn dirty_ids(&self, kind: EntityKind) -> (Vec<i64>, Vec<i64>) {
        let state = self.state.lock().unwrap();
        let table = &state.tables[kind.index()];
        let mut modified: Vec<i64> = table.modified.iter().copied().collect();
        let mut deleted: Vec<i64> = table.deleted.iter().copied().collect();
        modified.sort_unstable();
        deleted.sort_unstable();
        (modified, deleted)
    }
}
