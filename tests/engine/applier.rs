//! Optimistic mutation path while online.

use std::time::Duration;

use serde_json::json;

use confession_sync::engine::{DiscardReason, EngineEvent, RollbackReason};
use confession_sync::remote::{RemoteError, RemoteErrorKind, RemoteMutation, WriteAck};
use confession_sync::types::{CollectionKey, Domain, Entity, EntityId};
use confession_sync::{MutationOutcome, SyncError};

use super::common::*;

fn confessions() -> CollectionKey {
    CollectionKey::new(Domain::Confessions)
}

fn rolled_back(h: &Harness) -> usize {
    h.count_events(|e| matches!(e, EngineEvent::MutationRolledBack { .. }))
}

#[tokio::test(start_paused = true)]
async fn like_applies_immediately_and_confirms() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("e", 10)]);
    h.remote.delay_writes(Duration::from_millis(200));
    h.remote.on_write(|m| match m {
        RemoteMutation::ToggleLike { liked: true, .. } => {
            Ok(WriteAck::Fields(fields(json!({"likes": 11, "is_liked": true}))))
        }
        other => panic!("unexpected write {other:?}"),
    });

    let engine = h.engine.clone();
    let k = key.clone();
    let pending =
        tokio::spawn(async move { engine.toggle_like(&k, &EntityId::stable("e")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let during = h.engine.get(&key, &"e".into()).unwrap();
    assert_eq!(during.counter("likes"), 11);
    assert!(during.flag("is_liked"));

    let outcome = pending.await.unwrap().unwrap();
    assert!(outcome.is_applied());
    assert_eq!(outcome.entity().unwrap().counter("likes"), 11);
    assert_eq!(h.remote.writes().len(), 1);
    assert_eq!(rolled_back(&h), 0);
}

#[tokio::test]
async fn server_count_wins_over_optimistic_guess() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("e", 10)]);
    // Other viewers liked it meanwhile.
    h.remote
        .on_write(|_| Ok(WriteAck::Fields(fields(json!({"likes": 42, "is_liked": true})))));

    h.engine.toggle_like(&key, &"e".into()).await.unwrap();

    let e = h.engine.get(&key, &"e".into()).unwrap();
    assert_eq!(e.counter("likes"), 42);
    assert_eq!(e.get("body"), Some(&json!("confession e")));
}

#[tokio::test]
async fn unlike_decrements_and_never_goes_negative() {
    let h = harness(true);
    let key = confessions();
    let mut liked = post("e", 0);
    liked.set("is_liked", json!(true));
    h.seed(&key, vec![liked]);

    h.engine.toggle_like(&key, &"e".into()).await.unwrap();

    let e = h.engine.get(&key, &"e".into()).unwrap();
    assert_eq!(e.counter("likes"), 0);
    assert!(!e.flag("is_liked"));
    assert!(matches!(
        h.remote.writes()[0],
        RemoteMutation::ToggleLike { liked: false, .. }
    ));
}

#[tokio::test]
async fn rejected_like_restores_exact_snapshot() {
    let h = harness(true);
    let key = confessions();
    let original = post("e", 10);
    h.seed(&key, vec![post("a", 1), original.clone(), post("b", 2)]);
    h.remote
        .on_write(|_| Err(RemoteError::from_code("401", "JWT expired")));

    let outcome = h.engine.toggle_like(&key, &"e".into()).await.unwrap();

    match outcome {
        MutationOutcome::RolledBack(RollbackReason::Rejected(e)) => {
            assert_eq!(e.kind, RemoteErrorKind::Unauthenticated)
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(h.engine.get(&key, &"e".into()).unwrap(), original);
    assert_eq!(h.ids(&key), vec!["a", "e", "b"]);
    assert_eq!(rolled_back(&h), 1);
}

#[tokio::test]
async fn transient_failure_while_online_rolls_back_without_queueing() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("e", 10)]);
    h.remote
        .on_write(|_| Err(RemoteError::from_code("503", "unavailable")));

    let outcome = h.engine.toggle_like(&key, &"e".into()).await.unwrap();

    assert!(matches!(
        outcome,
        MutationOutcome::RolledBack(RollbackReason::Transient(_))
    ));
    assert_eq!(h.engine.get(&key, &"e".into()).unwrap().counter("likes"), 10);
    assert!(h.engine.pending_actions().is_empty());
}

#[tokio::test]
async fn connection_lost_mid_write_queues_instead_of_rolling_back() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("e", 10)]);
    let connectivity = h.connectivity.clone();
    h.remote.on_write(move |_| {
        connectivity.set_online(false);
        Err(RemoteError::transient("network request failed"))
    });

    let outcome = h.engine.toggle_like(&key, &"e".into()).await.unwrap();

    assert!(outcome.is_queued());
    assert_eq!(h.engine.get(&key, &"e".into()).unwrap().counter("likes"), 11);
    assert_eq!(h.engine.pending_actions().len(), 1);
    assert_eq!(rolled_back(&h), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_write_times_out_and_rolls_back() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("e", 10)]);
    h.remote.delay_writes(Duration::from_secs(60));

    let outcome = h.engine.toggle_like(&key, &"e".into()).await.unwrap();

    match outcome {
        MutationOutcome::RolledBack(RollbackReason::Transient(e)) => {
            assert_eq!(e.kind, RemoteErrorKind::Timeout)
        }
        other => panic!("expected timeout rollback, got {other:?}"),
    }
    assert_eq!(h.engine.get(&key, &"e".into()).unwrap().counter("likes"), 10);
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_likes_share_one_write() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("e", 10)]);
    h.remote.delay_writes(Duration::from_millis(100));
    h.remote
        .on_write(|_| Ok(WriteAck::Fields(fields(json!({"likes": 11, "is_liked": true})))));

    let id = EntityId::stable("e");
    let (first, second) = tokio::join!(
        h.engine.toggle_like(&key, &id),
        h.engine.toggle_like(&key, &id)
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(h.remote.writes().len(), 1);
    assert_eq!(h.engine.get(&key, &id).unwrap().counter("likes"), 11);

    // Settled: the next tap is a fresh unlike.
    h.remote
        .on_write(|_| Ok(WriteAck::Fields(fields(json!({"likes": 10, "is_liked": false})))));
    h.engine.toggle_like(&key, &id).await.unwrap();
    assert_eq!(h.remote.writes().len(), 2);
    assert_eq!(h.engine.get(&key, &id).unwrap().counter("likes"), 10);
}

#[tokio::test]
async fn create_replaces_placeholder_in_place() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0), post("b", 0)]);
    h.remote.on_write(|m| match m {
        RemoteMutation::Create { fields, .. } => {
            let mut stored = Entity::new("p1", fields.clone());
            stored.set("likes", json!(0));
            Ok(WriteAck::Entity(stored))
        }
        other => panic!("unexpected write {other:?}"),
    });

    let outcome = h
        .engine
        .create(&key, fields(json!({"body": "first!"})))
        .await
        .unwrap();

    assert_eq!(outcome.entity().unwrap().id, EntityId::stable("p1"));
    assert_eq!(h.ids(&key), vec!["p1", "a", "b"]);
    let created = h.engine.get(&key, &"p1".into()).unwrap();
    assert_eq!(created.get("body"), Some(&json!("first!")));
}

#[tokio::test]
async fn rejected_create_removes_placeholder() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);
    h.remote
        .on_write(|_| Err(RemoteError::from_code("23505", "duplicate key")));

    let outcome = h
        .engine
        .create(&key, fields(json!({"body": "dup"})))
        .await
        .unwrap();

    assert!(outcome.is_rolled_back());
    assert_eq!(h.ids(&key), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn create_acknowledged_without_id_is_rolled_back() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);
    h.remote.delay_writes(Duration::from_millis(200));
    h.remote
        .on_write(|_| Ok(WriteAck::Fields(fields(json!({"likes": 0})))));

    let like_placeholder = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let temp = EntityId::parse(h.ids(&key)[0].clone());
        assert!(temp.is_temp());
        h.engine.toggle_like(&key, &temp).await.unwrap()
    };
    let (created, liked) = tokio::join!(
        h.engine.create(&key, fields(json!({"body": "hi"}))),
        like_placeholder
    );

    assert!(matches!(
        created.unwrap(),
        MutationOutcome::RolledBack(RollbackReason::Rejected(_))
    ));
    assert!(liked.is_queued());
    assert_eq!(h.ids(&key), vec!["a"]);
    assert!(h.engine.pending_actions().is_empty());
    assert_eq!(h.remote.writes().len(), 1);
    assert_eq!(rolled_back(&h), 1);
    assert_eq!(
        h.count_events(|e| matches!(
            e,
            EngineEvent::ActionDiscarded {
                reason: DiscardReason::Cancelled,
                ..
            }
        )),
        1
    );
}

#[tokio::test]
async fn edit_touches_only_given_fields_and_reverts_on_rejection() {
    let h = harness(true);
    let key = CollectionKey::new(Domain::Notifications);
    let original = Entity::new("n1", fields(json!({"text": "new reply", "read": false})));
    h.seed(&key, vec![original.clone()]);

    h.engine
        .edit(&key, &"n1".into(), fields(json!({"read": true})))
        .await
        .unwrap();
    let n1 = h.engine.get(&key, &"n1".into()).unwrap();
    assert_eq!(n1.get("read"), Some(&json!(true)));
    assert_eq!(n1.get("text"), Some(&json!("new reply")));

    h.remote
        .on_write(|_| Err(RemoteError::from_code("42501", "permission denied")));
    let outcome = h
        .engine
        .edit(&key, &"n1".into(), fields(json!({"text": "edited"})))
        .await
        .unwrap();
    assert!(outcome.is_rolled_back());
    assert_eq!(h.engine.get(&key, &"n1".into()).unwrap(), n1);
}

#[tokio::test]
async fn rejected_remove_restores_position() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0), post("b", 0), post("c", 0)]);
    h.remote
        .on_write(|_| Err(RemoteError::from_code("403", "not owner")));

    let outcome = h.engine.remove(&key, &"b".into()).await.unwrap();

    assert!(outcome.is_rolled_back());
    assert_eq!(h.ids(&key), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn remove_applies_when_accepted() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0), post("b", 0)]);

    let outcome = h.engine.remove(&key, &"a".into()).await.unwrap();

    assert_eq!(outcome, MutationOutcome::Applied(None));
    assert_eq!(h.ids(&key), vec!["b"]);
}

#[tokio::test]
async fn mutation_on_unknown_entity_is_an_error() {
    let h = harness(true);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);

    let err = h.engine.toggle_like(&key, &"ghost".into()).await.unwrap_err();

    assert!(matches!(err, SyncError::NotFound { .. }));
    assert!(h.remote.writes().is_empty());
}
