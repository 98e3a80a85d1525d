use griddle::store::sql::{SqlConnector, SqlStore};
use griddle::store::BackingStore;
use griddle::{Core, CoreConfig, EntityKind, Record, Story, StoreConfig};
use tempfile::TempDir;

fn sqlite_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        url: Some(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("griddle.db").display()
        )),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn schema_and_crud_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = SqlStore::connect(&sqlite_config(&dir)).await.unwrap();
    store.ping().await.unwrap();

    let record = Record::Story(Story::new(1, "Title", "Body", 7));
    store.upsert(&record).await.unwrap();
    assert_eq!(
        store.fetch_all(EntityKind::Story).await.unwrap(),
        vec![record]
    );

    // Upserting the same id replaces the row.
    let updated = Record::Story(Story::new(1, "Title 2", "Body 2", 7));
    store.upsert(&updated).await.unwrap();
    assert_eq!(
        store.fetch_all(EntityKind::Story).await.unwrap(),
        vec![updated]
    );

    store.delete(EntityKind::Story, 1).await.unwrap();
    assert!(store.fetch_all(EntityKind::Story).await.unwrap().is_empty());
    // Deleting an absent id is not an error.
    store.delete(EntityKind::Story, 99).await.unwrap();
}

#[tokio::test]
async fn tables_exist_for_every_kind() {
    let dir = TempDir::new().unwrap();
    let store = SqlStore::connect(&sqlite_config(&dir)).await.unwrap();
    for kind in EntityKind::ALL {
        assert!(store.fetch_all(kind).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn core_hydrates_from_sqlite() {
    let dir = TempDir::new().unwrap();
    let config = sqlite_config(&dir);
    {
        let store = SqlStore::connect(&config).await.unwrap();
        store
            .upsert(&Record::Story(Story::new(5, "T", "C", 7)))
            .await
            .unwrap();
    }

    let fallback_dir = TempDir::new().unwrap();
    let core_config = CoreConfig {
        fallback_dir: fallback_dir.path().to_path_buf(),
        ..CoreConfig::default()
    };
    let core = Core::new(core_config, Box::new(SqlConnector::new(config))).unwrap();
    assert!(core.connection.connect().await);
    assert!(core.reconciler.load_initial().await);

    assert_eq!(core.cache.counts(EntityKind::Story).live, 1);
    let (modified, deleted) = core.cache.dirty_ids(EntityKind::Story);
    assert!(modified.is_empty() && deleted.is_empty());
    // The id counter advanced past the hydrated rows.
    assert_eq!(core.cache.add(Record::Story(Story::new(0, "n", "c", 1))), 6);
}
