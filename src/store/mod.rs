//! Backing-store seam.
//!
//! The reconciler talks to the system of record through [`BackingStore`];
//! the connection manager creates sessions through [`Connector`]. The SQL
//! implementation is the production path, the memory implementation exists
//! for tests and demos that need a scriptable outage.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{EntityKind, Record};

/// One live session against the system of record.
///
/// Implementations classify unreachable/timeout failures as
/// [`crate::GriddleError::Connectivity`] so the retry machinery can tell
/// them apart from real errors.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;

    /// Full table scan, used to hydrate the cache at startup.
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// Insert or fully replace the row for this record's id.
    async fn upsert(&self, record: &Record) -> Result<()>;

    /// Remove a row. Deleting an absent id is not an error.
    async fn delete(&self, kind: EntityKind, id: i64) -> Result<()>;
}

/// Creates [`BackingStore`] sessions; owned by the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BackingStore>>;
}
