//! Backing-store connection lifecycle.
//!
//! Owns the live [`BackingStore`] session, a cached availability status,
//! bounded reconnection, and the retrying execute wrapper the reconciler
//! runs its batches through. All sleeps happen here, never under the
//! cache guard.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::CoreConfig;
use crate::error::{GriddleError, Result};
use crate::store::{BackingStore, Connector};

struct StoreStatus {
    available: bool,
    last_probe: Option<Instant>,
    error_count: u32,
    last_error_at: Option<Instant>,
}

impl StoreStatus {
    fn mark_success(&mut self) {
        self.available = true;
        self.error_count = 0;
        self.last_probe = Some(Instant::now());
    }

    fn mark_error(&mut self) {
        self.available = false;
        self.error_count += 1;
        self.last_error_at = Some(Instant::now());
        self.last_probe = Some(Instant::now());
    }
}

/// Point-in-time view of the connection status for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub available: bool,
    pub error_count: u32,
    pub seconds_since_probe: Option<u64>,
    pub seconds_since_error: Option<u64>,
}

pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    store: Mutex<Option<Arc<dyn BackingStore>>>,
    status: StdMutex<StoreStatus>,
    probe_interval: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn Connector>, config: &CoreConfig) -> Self {
        ConnectionManager {
            connector,
            store: Mutex::new(None),
            status: StdMutex::new(StoreStatus {
                available: false,
                last_probe: None,
                error_count: 0,
                last_error_at: None,
            }),
            probe_interval: config.probe_interval,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// Establish the initial session. Failure is not fatal: the core
    /// starts degraded and the reconciler keeps retrying.
    pub async fn connect(&self) -> bool {
        match self.connector.connect().await {
            Ok(store) => {
                *self.store.lock().await = Some(store);
                self.status.lock().unwrap().mark_success();
                true
            }
            Err(e) => {
                tracing::warn!("[CONN] initial connect failed: {}", e);
                self.status.lock().unwrap().mark_error();
                false
            }
        }
    }

    /// Cached availability, re-probed only when the probe interval has
    /// elapsed since the last check.
    pub async fn is_available(&self) -> bool {
        {
            let status = self.status.lock().unwrap();
            if let Some(last) = status.last_probe {
                if last.elapsed() < self.probe_interval {
                    return status.available;
                }
            }
        }
        self.probe().await
    }

    /// Unconditional probe of the current session.
    async fn probe(&self) -> bool {
        let store = self.store.lock().await.clone();
        let outcome = match store {
            Some(store) => store.ping().await,
            None => Err(GriddleError::Connectivity("no session".to_string())),
        };
        let mut status = self.status.lock().unwrap();
        match outcome {
            Ok(()) => {
                status.mark_success();
                true
            }
            Err(e) => {
                tracing::warn!("[CONN] probe failed: {}", e);
                status.mark_error();
                false
            }
        }
    }

    /// Up to `max_attempts` fresh connects with linearly increasing delay
    /// between failures. The previous session is dropped before each
    /// attempt. Returns true on the first success.
    pub async fn reconnect(&self) -> bool {
        for attempt in 1..=self.max_attempts {
            tracing::info!("[CONN] reconnect attempt {}/{}", attempt, self.max_attempts);
            self.store.lock().await.take();
            match self.connector.connect().await {
                Ok(store) => {
                    *self.store.lock().await = Some(store);
                    self.status.lock().unwrap().mark_success();
                    tracing::info!("[CONN] reconnected");
                    return true;
                }
                Err(e) => {
                    tracing::warn!("[CONN] reconnect attempt {} failed: {}", attempt, e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
        tracing::error!("[CONN] reconnect failed after {} attempts", self.max_attempts);
        self.status.lock().unwrap().mark_error();
        false
    }

    async fn acquire(&self) -> Result<Arc<dyn BackingStore>> {
        if !self.is_available().await {
            tracing::warn!("[CONN] store unavailable, forcing reconnect");
            if !self.reconnect().await {
                return Err(GriddleError::Connectivity(
                    "reconnect exhausted".to_string(),
                ));
            }
        }
        self.store.lock().await.clone().ok_or_else(|| {
            GriddleError::Connectivity("no session after reconnect".to_string())
        })
    }

    /// Run `op` against a live session, retrying transient failures up to
    /// the attempt budget with a fixed delay and a reconnect in between.
    /// Non-transient errors propagate immediately; the last transient error
    /// surfaces once the budget is exhausted.
    pub async fn execute_with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn BackingStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = GriddleError::Connectivity("no attempts made".to_string());
        for attempt in 1..=self.max_attempts {
            let store = match self.acquire().await {
                Ok(store) => store,
                Err(e) => {
                    last_err = e;
                    break;
                }
            };
            match op(store).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "[CONN] operation failed (attempt {}/{}): {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    self.status.lock().unwrap().mark_error();
                    last_err = e;
                    if attempt < self.max_attempts {
                        if !self.reconnect().await {
                            break;
                        }
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub fn status(&self) -> StatusSnapshot {
        let status = self.status.lock().unwrap();
        StatusSnapshot {
            available: status.available,
            error_count: status.error_count,
            seconds_since_probe: status.last_probe.map(|t| t.elapsed().as_secs()),
            seconds_since_error: status.last_error_at.map(|t| t.elapsed().as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryConnector, MemoryStore};
    use crate::types::{EntityKind, Record, Story};

    fn manager(store: &Arc<MemoryStore>) -> ConnectionManager {
        let config = CoreConfig {
            probe_interval: Duration::from_millis(20),
            max_attempts: 3,
            retry_delay: Duration::from_millis(5),
            ..CoreConfig::default()
        };
        ConnectionManager::new(Box::new(MemoryConnector::new(store.clone())), &config)
    }

    #[tokio::test]
    async fn availability_is_cached_between_probes() {
        let store = MemoryStore::new();
        let conn = manager(&store);
        assert!(conn.connect().await);
        assert!(conn.is_available().await);

        // Within the probe interval the cached status is served even
        // though the store just went down.
        store.set_online(false);
        assert!(conn.is_available().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!conn.is_available().await);
        assert!(conn.status().error_count >= 1);
    }

    #[tokio::test]
    async fn reconnect_succeeds_mid_budget() {
        let store = MemoryStore::new();
        let conn = manager(&store);
        store.set_online(false);
        assert!(!conn.connect().await);

        // Restore connectivity from another task while reconnect is
        // sleeping between its first and second attempts.
        let restore = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            restore.set_online(true);
        });
        assert!(conn.reconnect().await);
        handle.await.unwrap();
        assert!(conn.status().available);
    }

    #[tokio::test]
    async fn reconnect_exhausts_budget_and_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_online(false);
        let conn = manager(&store);
        assert!(!conn.reconnect().await);
        let status = conn.status();
        assert!(!status.available);
        assert!(status.error_count >= 1);
    }

    #[tokio::test]
    async fn execute_with_retry_runs_operation() {
        let store = MemoryStore::new();
        let conn = manager(&store);
        conn.connect().await;
        let record = Record::Story(Story::new(1, "T", "C", 1));
        conn.execute_with_retry(|s| {
            let record = record.clone();
            async move { s.upsert(&record).await }
        })
        .await
        .unwrap();
        assert!(store.contains(EntityKind::Story, 1));
    }

    #[tokio::test]
    async fn execute_with_retry_surfaces_last_transient_error() {
        let store = MemoryStore::new();
        let conn = manager(&store);
        conn.connect().await;
        store.set_online(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = conn
            .execute_with_retry(|s| async move { s.ping().await })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn non_transient_errors_propagate_immediately() {
        let store = MemoryStore::new();
        let conn = manager(&store);
        conn.connect().await;
        let err = conn
            .execute_with_retry(|_s| async move {
                Err::<(), _>(GriddleError::Sql("constraint violation".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GriddleError::Sql(_)));
    }
}
