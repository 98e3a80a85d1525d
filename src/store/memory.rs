//! In-memory backing store with a scriptable outage switch.
//!
//! Used by integration tests and demos to simulate the relational store
//! going away and coming back without a real database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{BackingStore, Connector};
use crate::error::{GriddleError, Result};
use crate::types::{EntityKind, Record};

pub struct MemoryStore {
    online: AtomicBool,
    write_ops: AtomicUsize,
    rows: Mutex<HashMap<(EntityKind, i64), Record>>,
    op_log: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore {
            online: AtomicBool::new(true),
            write_ops: AtomicUsize::new(0),
            rows: Mutex::new(HashMap::new()),
            op_log: Mutex::new(Vec::new()),
        })
    }

    /// Flip the simulated outage. While offline every operation (and every
    /// new connection) fails with a connectivity error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of upsert/delete calls that reached the store. Lets tests
    /// assert that an idle sync pass performs zero persistence operations.
    pub fn write_op_count(&self) -> usize {
        self.write_ops.load(Ordering::SeqCst)
    }

    /// Writes that reached the store, in arrival order, as
    /// `"upsert <table> <id>"` / `"delete <table> <id>"` lines.
    pub fn operations(&self) -> Vec<String> {
        self.op_log.lock().unwrap().clone()
    }

    pub fn contains(&self, kind: EntityKind, id: i64) -> bool {
        self.rows.lock().unwrap().contains_key(&(kind, id))
    }

    pub fn rows_for(&self, kind: EntityKind) -> Vec<Record> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn seed(&self, record: Record) {
        self.rows
            .lock()
            .unwrap()
            .insert((record.kind(), record.id()), record);
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(GriddleError::Connectivity("simulated outage".to_string()))
        }
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.check_online()?;
        Ok(self.rows_for(kind))
    }

    async fn upsert(&self, record: &Record) -> Result<()> {
        self.check_online()?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        self.op_log
            .lock()
            .unwrap()
            .push(format!("upsert {} {}", record.kind().table(), record.id()));
        self.rows
            .lock()
            .unwrap()
            .insert((record.kind(), record.id()), record.clone());
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> Result<()> {
        self.check_online()?;
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        self.op_log
            .lock()
            .unwrap()
            .push(format!("delete {} {}", kind.table(), id));
        self.rows.lock().unwrap().remove(&(kind, id));
        Ok(())
    }
}

/// Hands out sessions backed by one shared [`MemoryStore`]. Connecting
/// fails while the store is offline, mirroring a refused TCP connect.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        MemoryConnector { store }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BackingStore>> {
        self.store.check_online()?;
        Ok(self.store.clone())
    }
}
