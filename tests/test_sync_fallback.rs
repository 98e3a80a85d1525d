mod common;

use griddle::{EntityKind, Record, Story, SyncOutcome};
use serde_json::json;

#[tokio::test]
async fn outage_reroutes_to_disk_and_recovery_drains_it() {
    let (core, store, _dir) = common::memory_core();
    assert!(core.connection.connect().await);

    let id = core
        .cache
        .add(Record::Story(Story::new(0, "Title", "Body", 7)));

    store.set_online(false);
    common::outlive_probe_cache().await;

    let outcome = core.reconciler.sync_with_fallback().await;
    assert_eq!(outcome, SyncOutcome::FellBack);

    // The record is durable on disk, and the cache still owes it to the
    // backing store.
    assert_eq!(
        core.fallback.get_item(EntityKind::Story, id),
        core.cache.get(EntityKind::Story, id)
    );
    let (modified, _) = core.cache.dirty_ids(EntityKind::Story);
    assert_eq!(modified, vec![id]);
    assert_eq!(store.write_op_count(), 0);

    store.set_online(true);
    common::outlive_probe_cache().await;
    let outcome = core.reconciler.sync_with_fallback().await;
    assert_eq!(outcome, SyncOutcome::Synced);

    assert!(store.contains(EntityKind::Story, id));
    let (modified, deleted) = core.cache.dirty_ids(EntityKind::Story);
    assert!(modified.is_empty() && deleted.is_empty());
    assert!(!core.fallback.has_pending());
}

#[tokio::test]
async fn offline_delete_is_replayed_after_recovery() {
    let (core, store, _dir) = common::memory_core();
    assert!(core.connection.connect().await);

    let id = core.cache.add(Record::Story(Story::new(0, "T", "C", 7)));
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );
    assert!(store.contains(EntityKind::Story, id));

    store.set_online(false);
    common::outlive_probe_cache().await;
    assert!(core.cache.delete(EntityKind::Story, id));
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::FellBack
    );
    assert_eq!(core.fallback.counts(EntityKind::Story).deleted, 1);

    store.set_online(true);
    common::outlive_probe_cache().await;
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );
    assert!(!store.contains(EntityKind::Story, id));
    assert!(!core.fallback.has_pending());
}

#[tokio::test]
async fn recovery_keeps_the_newer_write_over_the_stale_disk_copy() {
    let (core, store, _dir) = common::memory_core();
    assert!(core.connection.connect().await);

    let id = core.cache.add(Record::Story(Story::new(0, "old", "Body", 7)));
    store.set_online(false);
    common::outlive_probe_cache().await;
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::FellBack
    );

    // The record is updated while its stale copy sits on disk.
    store.set_online(true);
    common::outlive_probe_cache().await;
    assert!(core
        .cache
        .update(
            EntityKind::Story,
            id,
            json!({"title": "new"}).as_object().unwrap()
        )
        .unwrap());
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );

    match store.rows_for(EntityKind::Story).pop().unwrap() {
        Record::Story(s) => assert_eq!(s.title, "new"),
        _ => unreachable!(),
    }
    assert!(!core.fallback.has_pending());

    // The next pass has nothing left to push over the confirmed write.
    let ops = store.write_op_count();
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );
    assert_eq!(store.write_op_count(), ops);
    match store.rows_for(EntityKind::Story).pop().unwrap() {
        Record::Story(s) => assert_eq!(s.title, "new"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn stale_tombstone_does_not_shadow_a_readded_record() {
    let (core, store, _dir) = common::memory_core();
    assert!(core.connection.connect().await);

    let id = core.cache.add(Record::Story(Story::new(0, "T", "C", 7)));
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );

    store.set_online(false);
    common::outlive_probe_cache().await;
    assert!(core.cache.delete(EntityKind::Story, id));
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::FellBack
    );

    // The user re-adds the record before connectivity returns.
    core.cache.add(Record::Story(Story::new(id, "T2", "C2", 7)));

    store.set_online(true);
    common::outlive_probe_cache().await;
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );
    assert!(store.contains(EntityKind::Story, id));
    assert!(!core.fallback.has_pending());
}

#[tokio::test]
async fn idle_pass_performs_no_writes() {
    let (core, store, _dir) = common::memory_core();
    assert!(core.connection.connect().await);

    core.cache.add(Record::Story(Story::new(0, "T", "C", 1)));
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );
    let after_first = store.write_op_count();
    assert_eq!(after_first, 1);

    // Nothing dirty anywhere: the pass returns without touching the store
    // or the disk.
    assert_eq!(
        core.reconciler.sync_with_fallback().await,
        SyncOutcome::Synced
    );
    assert_eq!(store.write_op_count(), after_first);
}

#[tokio::test]
async fn hydrates_from_fallback_when_store_is_down() {
    let (core, store, _dir) = common::memory_core();
    store.set_online(false);
    assert!(!core.connection.connect().await);

    // What a previous process would have left behind during an outage.
    core.fallback
        .add_item(&Record::Story(Story::new(3, "T", "C", 1)))
        .unwrap();

    assert!(!core.reconciler.load_initial().await);
    assert!(core.cache.get(EntityKind::Story, 3).is_some());
    // Fallback-sourced records are not re-dirtied; the fallback flags
    // already owe them to the backing store.
    let (modified, _) = core.cache.dirty_ids(EntityKind::Story);
    assert!(modified.is_empty());
}
