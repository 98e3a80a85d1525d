//! SQL backing store over sqlx's `Any` driver.
//!
//! One table per entity kind, `id BIGINT PRIMARY KEY` plus the full record
//! as a JSON `TEXT` payload. TEXT instead of a native JSON column because
//! the `Any` driver has no JSON type mapping and reads long text back as
//! bytes on MySQL. `REPLACE INTO` is the upsert form both MySQL and SQLite
//! accept, which keeps tests on SQLite and production on MySQL behind the
//! same statements.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Arc;

use super::{BackingStore, Connector};
use crate::config::StoreConfig;
use crate::error::{GriddleError, Result};
use crate::types::{EntityKind, Record};

static DRIVERS: OnceCell<()> = OnceCell::new();

fn install_drivers() {
    DRIVERS.get_or_init(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        install_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.connection_url())
            .await?;
        let store = SqlStore { pool };
        store.ensure_schema().await?;
        tracing::info!("[SQL] connected to backing store");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            let stmt = format!(
                "CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY, payload TEXT NOT NULL)",
                kind.table()
            );
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// The Any driver surfaces TEXT as String on SQLite but as bytes on MySQL.
fn read_payload(row: &AnyRow) -> Result<String> {
    match row.try_get::<String, _>("payload") {
        Ok(text) => Ok(text),
        Err(_) => {
            let bytes: Vec<u8> = row.try_get("payload")?;
            String::from_utf8(bytes)
                .map_err(|e| GriddleError::Sql(format!("payload is not UTF-8: {}", e)))
        }
    }
}

#[async_trait]
impl BackingStore for SqlStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let stmt = format!("SELECT id, payload FROM {}", kind.table());
        let rows = sqlx::query(&stmt).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload = read_payload(row)?;
            let value: serde_json::Value = serde_json::from_str(&payload)?;
            records.push(Record::from_payload(kind, value)?);
        }
        Ok(records)
    }

    async fn upsert(&self, record: &Record) -> Result<()> {
        let stmt = format!(
            "REPLACE INTO {} (id, payload) VALUES (?, ?)",
            record.kind().table()
        );
        let payload = serde_json::to_string(&record.to_payload()?)?;
        sqlx::query(&stmt)
            .bind(record.id())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> Result<()> {
        let stmt = format!("DELETE FROM {} WHERE id = ?", kind.table());
        sqlx::query(&stmt).bind(id).execute(&self.pool).await?;
        Ok(())
    }
}

/// Production connector: builds a fresh pool per connect so a reconnect
/// after an outage never reuses poisoned pool state.
pub struct SqlConnector {
    config: StoreConfig,
}

impl SqlConnector {
    pub fn new(config: StoreConfig) -> Self {
        SqlConnector { config }
    }
}

#[async_trait]
impl Connector for SqlConnector {
    async fn connect(&self) -> Result<Arc<dyn BackingStore>> {
        let store = SqlStore::connect(&self.config).await?;
        Ok(Arc::new(store))
    }
}
