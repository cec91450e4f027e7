//! Engine construction, restore, event listeners and disposal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use confession_sync::config::EngineConfig;
use confession_sync::realtime::SubscriptionStatus;
use confession_sync::remote::{RemoteError, WriteAck};
use confession_sync::storage::{MemoryBackend, StorageBackend};
use confession_sync::types::{CollectionKey, Domain, Entity};
use confession_sync::{EngineEvent, SyncError};

use super::common::*;

fn confessions() -> CollectionKey {
    CollectionKey::new(Domain::Confessions)
}

#[tokio::test]
async fn disposed_engine_refuses_work() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);
    assert!(h.engine.subscribe(&key).unwrap());
    let rx = h.engine.watch_subscription(&key).unwrap();

    h.engine.dispose();
    h.engine.dispose();

    assert!(h.engine.is_disposed());
    assert_eq!(rx.borrow().status, SubscriptionStatus::Closed);
    assert!(h.engine.subscription_state(&key).is_none());
    assert!(matches!(
        h.engine.toggle_like(&key, &"a".into()).await,
        Err(SyncError::Disposed)
    ));
    assert!(matches!(h.engine.subscribe(&key), Err(SyncError::Disposed)));
    assert!(matches!(h.engine.drain_queue().await, Err(SyncError::Disposed)));
    assert!(matches!(
        h.engine.load_initial(&key).await,
        Err(SyncError::Disposed)
    ));
    assert!(h.remote.writes().is_empty());
}

#[tokio::test]
async fn removed_listener_stops_receiving() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);
    h.remote
        .on_write(|_| Err(RemoteError::rejected("nope")));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let id = h.engine.on_event(move |e| {
        if matches!(e, EngineEvent::MutationRolledBack { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    h.engine.toggle_like(&key, &"a".into()).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(h.engine.off_event(id));
    assert!(!h.engine.off_event(id));
    h.engine.toggle_like(&key, &"a".into()).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn state_listeners_see_optimistic_change() {
    let h = harness(false);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = changes.clone();
    h.engine
        .state(Domain::Confessions)
        .on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    h.engine.toggle_like(&key, &"a".into()).await.unwrap();

    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restored_queue_drains_on_startup_when_online() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let key = confessions();
    {
        let h = harness_with(false, Some(backend.clone()), EngineConfig::default());
        h.seed(&key, vec![post("a", 0)]);
        h.engine.toggle_like(&key, &"a".into()).await.unwrap();
    }

    let h = harness_with(true, Some(backend), EngineConfig::default());
    h.remote
        .on_write(|_| Ok(WriteAck::Fields(fields(json!({"likes": 1, "is_liked": true})))));
    h.wait_for_event(is_drain_finished).await;

    assert!(h.engine.pending_actions().is_empty());
    assert_eq!(h.remote.writes().len(), 1);
}

#[tokio::test]
async fn namespaces_keep_engines_apart() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let key = confessions();
    let config = |ns: &str| EngineConfig {
        storage_namespace: ns.to_string(),
        ..EngineConfig::default()
    };

    {
        let h = harness_with(false, Some(backend.clone()), config("alice"));
        h.seed(&key, vec![post("a", 0)]);
        h.engine.toggle_like(&key, &"a".into()).await.unwrap();
    }

    let other = harness_with(false, Some(backend.clone()), config("bob"));
    assert!(other.engine.pending_actions().is_empty());
    assert!(other.engine.items(&key).is_empty());

    let same = harness_with(false, Some(backend), config("alice"));
    assert_eq!(same.engine.pending_actions().len(), 1);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backed_state_survives_restart() {
    use confession_sync::storage::SqliteBackend;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let key = confessions();

    {
        let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open(&path).unwrap());
        let h = harness_with(false, Some(backend), EngineConfig::default());
        h.seed(&key, vec![post("a", 4)]);
        h.engine
            .create(&key, fields(json!({"body": "saved offline"})))
            .await
            .unwrap();
        h.engine.dispose();
    }

    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open(&path).unwrap());
    let h = harness_with(false, Some(backend), EngineConfig::default());

    let report = h.engine.restore().unwrap();
    assert_eq!(report.queued_actions, 1);
    assert_eq!(report.collections, 1);

    let items: Vec<Entity> = h.engine.items(&key);
    assert_eq!(items.len(), 2);
    assert!(items[0].id.is_temp());
    assert_eq!(items[0].get("body"), Some(&json!("saved offline")));
    assert_eq!(items[1].counter("likes"), 4);
    assert_eq!(h.engine.pending_actions()[0].action_type(), "create");
}
