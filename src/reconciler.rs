//! Reconciliation between the cache, the backing store, and fallback
//! storage.
//!
//! One pass drains the cache's dirty snapshot into the backing store
//! (deletes in dependency order, then upserts), clearing flags per type
//! only after that type's batch is confirmed. Any failure reroutes the
//! unconfirmed remainder to fallback storage and leaves the cache flags
//! alone, so nothing is lost and a later pass retries against the store.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::cache::{Cache, DirtyBatch, DirtySnapshot};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::fallback::{FallbackStorage, ReplayOp};
use crate::types::EntityKind;

/// Result of one reconciliation pass. `FellBack` is the partial-success
/// case: data is durable on disk but still owed to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    FellBack,
    Failed,
}

pub struct Reconciler {
    cache: Arc<Cache>,
    connection: Arc<ConnectionManager>,
    fallback: Arc<FallbackStorage>,
    retention_days: i64,
    /// Serializes passes: the periodic task and the on-demand trigger must
    /// not interleave their snapshot/clear sequences.
    pass_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<Cache>,
        connection: Arc<ConnectionManager>,
        fallback: Arc<FallbackStorage>,
        retention_days: i64,
    ) -> Self {
        Reconciler {
            cache,
            connection,
            fallback,
            retention_days,
            pass_lock: Mutex::new(()),
        }
    }

    /// Hydrate the cache at startup: from the backing store when it
    /// answers, otherwise from whatever fallback storage holds. Returns
    /// true when the backing store was the source.
    pub async fn load_initial(&self) -> bool {
        let mut loaded_from_store = true;
        for kind in EntityKind::ALL {
            let fetched = self
                .connection
                .execute_with_retry(|store| async move { store.fetch_all(kind).await })
                .await;
            match fetched {
                Ok(records) => self.cache.load_records(kind, records),
                Err(e) => {
                    tracing::warn!("[SYNC] initial load of {} failed: {}", kind.table(), e);
                    loaded_from_store = false;
                    break;
                }
            }
        }
        if loaded_from_store {
            tracing::info!("[SYNC] cache hydrated from backing store");
            return true;
        }

        tracing::info!("[SYNC] hydrating cache from fallback storage");
        for kind in EntityKind::ALL {
            let records = self.fallback.get_all_items(kind);
            if !records.is_empty() {
                self.cache.load_records(kind, records);
            }
        }
        false
    }

    /// One reconciliation pass. With nothing dirty anywhere this returns
    /// immediately without touching the network or the disk.
    pub async fn sync_with_fallback(&self) -> SyncOutcome {
        let _pass = self.pass_lock.lock().await;

        let snapshot = self.cache.snapshot_dirty();
        let fallback_pending = self.fallback.has_pending();
        if snapshot.is_empty() && !fallback_pending {
            return SyncOutcome::Synced;
        }

        if self.connection.is_available().await {
            // Disk state is strictly older than cache state: replay it
            // before the direct push so the cache's copy wins any id both
            // sides carry. The reverse order would let a stale fallback
            // record or tombstone overwrite a just-confirmed newer write.
            let drained = if fallback_pending {
                self.drain_fallback().await
            } else {
                SyncOutcome::Synced
            };
            match self.push_direct(&snapshot).await {
                Ok(()) => return drained,
                Err((e, remaining)) => {
                    tracing::warn!("[SYNC] direct sync aborted, falling back to disk: {}", e);
                    return self.push_fallback(&remaining);
                }
            }
        }

        tracing::warn!("[SYNC] backing store unavailable, writing dirty state to disk");
        self.push_fallback(&snapshot)
    }

    /// Apply the snapshot to the backing store: all deletes in dependency
    /// order, then all upserts in the reverse order. Flags are cleared per
    /// type as each batch is confirmed. On error, returns the batches that
    /// were not confirmed.
    async fn push_direct(
        &self,
        snapshot: &DirtySnapshot,
    ) -> std::result::Result<(), (crate::error::GriddleError, DirtySnapshot)> {
        let mut deletes_done = vec![false; snapshot.batches.len()];
        let mut upserts_done = vec![false; snapshot.batches.len()];

        let result: Result<()> = async {
            for (i, batch) in snapshot.batches.iter().enumerate() {
                if batch.deletes.is_empty() {
                    deletes_done[i] = true;
                    continue;
                }
                let kind = batch.kind;
                let ids = batch.deletes.clone();
                self.connection
                    .execute_with_retry(|store| {
                        let ids = ids.clone();
                        async move {
                            for id in ids {
                                store.delete(kind, id).await?;
                            }
                            Ok(())
                        }
                    })
                    .await?;
                self.cache.clear_synced(kind, &[], &batch.deletes);
                self.fallback.discard_superseded(kind, &[], &batch.deletes);
                deletes_done[i] = true;
                tracing::debug!("[SYNC] deleted {} {} rows", batch.deletes.len(), kind.table());
            }

            for (i, batch) in snapshot.batches.iter().enumerate().rev() {
                if batch.upserts.is_empty() {
                    upserts_done[i] = true;
                    continue;
                }
                let kind = batch.kind;
                let records = batch.upserts.clone();
                self.connection
                    .execute_with_retry(|store| {
                        let records = records.clone();
                        async move {
                            for record in &records {
                                store.upsert(record).await?;
                            }
                            Ok(())
                        }
                    })
                    .await?;
                self.cache.clear_synced(kind, &batch.upserts, &[]);
                self.fallback.discard_superseded(kind, &batch.upserts, &[]);
                upserts_done[i] = true;
                tracing::debug!(
                    "[SYNC] upserted {} {} rows",
                    batch.upserts.len(),
                    kind.table()
                );
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let remaining = DirtySnapshot {
                    batches: snapshot
                        .batches
                        .iter()
                        .enumerate()
                        .map(|(i, batch)| DirtyBatch {
                            kind: batch.kind,
                            upserts: if upserts_done[i] {
                                Vec::new()
                            } else {
                                batch.upserts.clone()
                            },
                            deletes: if deletes_done[i] {
                                Vec::new()
                            } else {
                                batch.deletes.clone()
                            },
                        })
                        .collect(),
                };
                Err((e, remaining))
            }
        }
    }

    /// Route unconfirmed dirty state to fallback storage and persist it.
    /// Cache flags stay set so a later pass retries the backing store.
    fn push_fallback(&self, snapshot: &DirtySnapshot) -> SyncOutcome {
        let mut failed = false;
        for batch in &snapshot.batches {
            for id in &batch.deletes {
                self.fallback.mark_deleted(batch.kind, *id);
            }
            for record in &batch.upserts {
                if let Err(e) = self.fallback.add_item(record) {
                    tracing::error!(
                        "[SYNC] fallback write failed for {} {}: {}",
                        batch.kind.table(),
                        record.id(),
                        e
                    );
                    failed = true;
                }
            }
        }
        if let Err(e) = self.fallback.persist_dirty() {
            tracing::error!("[SYNC] fallback persist failed: {}", e);
            failed = true;
        }
        if failed {
            // Both durable targets are out; keep serving from memory and
            // let the health surface report it.
            SyncOutcome::Failed
        } else {
            SyncOutcome::FellBack
        }
    }

    /// Replay fallback-stored operations through the live backing store.
    async fn drain_fallback(&self) -> SyncOutcome {
        let connection = self.connection.clone();
        let tally = self
            .fallback
            .sync_to_database(|op| {
                let connection = connection.clone();
                async move {
                    connection
                        .execute_with_retry(|store| {
                            let op = op.clone();
                            async move {
                                match op {
                                    ReplayOp::Upsert(record) => store.upsert(&record).await,
                                    ReplayOp::Delete(kind, id) => store.delete(kind, id).await,
                                }
                            }
                        })
                        .await
                }
            })
            .await;
        match tally {
            Ok(tally) if tally.is_clean() => SyncOutcome::Synced,
            Ok(tally) => {
                tracing::warn!(
                    "[SYNC] fallback drain incomplete: {}/{}",
                    tally.succeeded,
                    tally.attempted
                );
                SyncOutcome::FellBack
            }
            Err(e) => {
                tracing::error!("[SYNC] fallback drain failed: {}", e);
                SyncOutcome::FellBack
            }
        }
    }

    /// Spawn the periodic reconciliation task. Shutdown is cooperative:
    /// the signal is observed between cycles, never mid-sync, and triggers
    /// one final best-effort drain plus retention cleanup before exit.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup isn't a sync.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = this.sync_with_fallback().await;
                        tracing::debug!("[SYNC] periodic pass: {:?}", outcome);
                        if let Err(e) = this.fallback.auto_persist() {
                            tracing::error!("[SYNC] auto persist failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        let stop = changed.is_err() || *shutdown.borrow();
                        if stop {
                            tracing::info!("[SYNC] shutdown: final drain");
                            let outcome = this.sync_with_fallback().await;
                            tracing::info!("[SYNC] final drain: {:?}", outcome);
                            if let Err(e) = this.fallback.cleanup_old_data(this.retention_days) {
                                tracing::error!("[SYNC] retention cleanup failed: {}", e);
                            }
                            if let Err(e) = this.fallback.persist_dirty() {
                                tracing::error!("[SYNC] final persist failed: {}", e);
                            }
                            break;
                        }
                    }
                }
            }
        })
    }
}
