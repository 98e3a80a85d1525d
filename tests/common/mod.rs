use griddle::store::memory::{MemoryConnector, MemoryStore};
use griddle::{Core, CoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Core wired to a scriptable in-memory store, with every interval shrunk
/// so probe expiry and retry budgets fit inside a test run.
#[allow(dead_code)]
pub fn memory_core() -> (Core, Arc<MemoryStore>, TempDir) {
    griddle::init_tracing();
    let dir = TempDir::new().unwrap();
    let config = CoreConfig {
        probe_interval: Duration::from_millis(20),
        max_attempts: 2,
        retry_delay: Duration::from_millis(5),
        sync_interval: Duration::from_millis(50),
        fallback_dir: dir.path().to_path_buf(),
        persist_interval: Duration::from_millis(0),
        retention_days: 7,
        rate_limit_window: Duration::from_secs(300),
    };
    let store = MemoryStore::new();
    let core = Core::new(config, Box::new(MemoryConnector::new(store.clone()))).unwrap();
    (core, store, dir)
}

/// Sleep past the probe interval so the next availability check re-probes
/// instead of serving the cached status.
#[allow(dead_code)]
pub async fn outlive_probe_cache() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
