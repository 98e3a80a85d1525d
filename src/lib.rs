//! # Griddle
//!
//! The write-back caching and reconciliation core of a content-sharing
//! application. Reads and writes are served from memory immediately;
//! dirty records are reconciled to a relational backing store in the
//! background, and a durable disk fallback absorbs pending changes
//! whenever the store is unreachable. Nothing is lost across an outage:
//! dirty flags survive until a change is confirmed durable somewhere.
//!
//! HTTP routing, templating, authentication, and admin UI live outside
//! this crate and only call the cache/sync/health operations re-exported
//! below.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use griddle::store::memory::{MemoryConnector, MemoryStore};
//! use griddle::{Core, CoreConfig, EntityKind, Record, Story};
//!
//! # async fn demo() -> griddle::Result<()> {
//! let dir = tempfile::TempDir::new()?;
//! let mut config = CoreConfig::default();
//! config.fallback_dir = dir.path().to_path_buf();
//!
//! let store = MemoryStore::new();
//! let core = Core::new(config, Box::new(MemoryConnector::new(store)))?;
//! core.connection.connect().await;
//!
//! // Writes land in memory and return immediately.
//! let id = core.cache.add(Record::Story(Story::new(0, "Title", "Body", 7)));
//! assert_eq!(core.cache.get_all(EntityKind::Story).len(), 1);
//!
//! // The reconciler pushes the dirty record to the backing store, or to
//! // disk when the store is down.
//! let outcome = core.reconciler.sync_with_fallback().await;
//! println!("synced story {}: {:?}", id, outcome);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod fallback;
pub mod health;
pub mod reconciler;
pub mod store;
pub mod types;

pub use cache::{Cache, DirtyBatch, DirtySnapshot, TableCounts};
pub use config::{CoreConfig, StoreConfig};
pub use connection::{ConnectionManager, StatusSnapshot};
pub use error::{GriddleError, Result};
pub use fallback::{FallbackStorage, ReplayOp, SyncTally};
pub use health::{HealthMonitor, HealthReport, HealthState};
pub use reconciler::{Reconciler, SyncOutcome};
pub use store::{BackingStore, Connector};
pub use types::{
    Chapter, ChapterComment, Discussion, DiscussionComment, EntityKind, Record, Story, TreeNode,
    User,
};

use std::sync::Arc;

/// Install the global tracing subscriber, honoring `RUST_LOG` and
/// defaulting to `info`. Call once from the embedding application;
/// repeated calls are harmless.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// The assembled core: every service as an explicit instance, shared by
/// handle. Construct one in the composition root and pass clones of the
/// `Arc`s to whoever needs them. There is no global state.
pub struct Core {
    pub cache: Arc<Cache>,
    pub connection: Arc<ConnectionManager>,
    pub fallback: Arc<FallbackStorage>,
    pub reconciler: Arc<Reconciler>,
    pub health: Arc<HealthMonitor>,
}

impl Core {
    pub fn new(config: CoreConfig, connector: Box<dyn Connector>) -> Result<Self> {
        let cache = Arc::new(Cache::new(config.rate_limit_window));
        let connection = Arc::new(ConnectionManager::new(connector, &config));
        let fallback = Arc::new(FallbackStorage::open(
            &config.fallback_dir,
            config.persist_interval,
        )?);
        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            connection.clone(),
            fallback.clone(),
            config.retention_days,
        ));
        let health = Arc::new(HealthMonitor::new(
            cache.clone(),
            connection.clone(),
            fallback.clone(),
            reconciler.clone(),
        ));
        Ok(Core {
            cache,
            connection,
            fallback,
            reconciler,
            health,
        })
    }
}
