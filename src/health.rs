//! Read-only health aggregation plus the two administrative triggers.
//!
//! An external surface (HTTP handler, CLI, whatever) renders
//! [`HealthReport`]; this module never mutates core state except through
//! the explicit force operations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{Cache, TableCounts};
use crate::connection::{ConnectionManager, StatusSnapshot};
use crate::fallback::FallbackStorage;
use crate::reconciler::{Reconciler, SyncOutcome};
use crate::types::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Backing store reachable.
    Healthy,
    /// Backing store down, disk fallback absorbing writes.
    Degraded,
    /// Backing store down and the fallback directory rejects writes;
    /// serving from volatile memory only.
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
    pub store: StatusSnapshot,
    pub fallback_writable: bool,
    pub cache: BTreeMap<&'static str, TableCounts>,
    pub fallback: BTreeMap<&'static str, TableCounts>,
}

pub struct HealthMonitor {
    cache: Arc<Cache>,
    connection: Arc<ConnectionManager>,
    fallback: Arc<FallbackStorage>,
    reconciler: Arc<Reconciler>,
}

impl HealthMonitor {
    pub fn new(
        cache: Arc<Cache>,
        connection: Arc<ConnectionManager>,
        fallback: Arc<FallbackStorage>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        HealthMonitor {
            cache,
            connection,
            fallback,
            reconciler,
        }
    }

    /// Snapshot of availability, per-type live counts, and dirty-set
    /// sizes. Serves the cached connection status and never probes the
    /// backing store; the only side effect is the writability check, which
    /// creates and removes one temp file in the fallback directory.
    pub fn report(&self) -> HealthReport {
        let store = self.connection.status();
        let fallback_writable = self.fallback.probe_writable();
        let status = match (store.available, fallback_writable) {
            (true, _) => HealthState::Healthy,
            (false, true) => HealthState::Degraded,
            (false, false) => HealthState::Unhealthy,
        };

        let mut cache = BTreeMap::new();
        let mut fallback = BTreeMap::new();
        for kind in EntityKind::ALL {
            cache.insert(kind.table(), self.cache.counts(kind));
            fallback.insert(kind.table(), self.fallback.counts(kind));
        }

        HealthReport {
            status,
            timestamp: Utc::now(),
            store,
            fallback_writable,
            cache,
            fallback,
        }
    }

    /// Synchronous on-demand reconciliation. `Synced` is success,
    /// `FellBack` is partial success (data durable on disk only).
    pub async fn force_sync(&self) -> SyncOutcome {
        tracing::info!("[HEALTH] force sync requested");
        self.reconciler.sync_with_fallback().await
    }

    /// On-demand reconnect through the bounded retry budget.
    pub async fn force_reconnect(&self) -> bool {
        tracing::info!("[HEALTH] force reconnect requested");
        self.connection.reconnect().await
    }
}
