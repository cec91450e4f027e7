//! Cursor pagination: first page, older pages, freshness, guard flag.

use std::time::Duration;

use serde_json::json;

use confession_sync::config::EngineConfig;
use confession_sync::pagination::LoadOutcome;
use confession_sync::remote::{PageRequest, PageResponse, RemoteError, RemoteErrorKind};
use confession_sync::types::{CollectionKey, Cursor, Domain, Entity};
use confession_sync::SyncError;

use super::common::*;

const PAGE: usize = 3;

fn confessions() -> CollectionKey {
    CollectionKey::new(Domain::Confessions)
}

fn paged(online: bool) -> Harness {
    harness_with(
        online,
        None,
        EngineConfig {
            page_size: PAGE,
            ..EngineConfig::default()
        },
    )
}

fn stamp(i: usize) -> String {
    format!("2024-01-01T00:00:{i:02}Z")
}

/// `n` posts, newest first, `c{n-1}` down to `c0`.
fn timeline(n: usize) -> Vec<Entity> {
    (0..n)
        .rev()
        .map(|i| {
            Entity::new(
                format!("c{i}"),
                fields(json!({"body": format!("post {i}"), "created_at": stamp(i)})),
            )
        })
        .collect()
}

/// Serve `posts` strictly older than the request boundary.
fn serve(posts: Vec<Entity>) -> impl Fn(&PageRequest) -> Result<PageResponse, RemoteError> {
    move |request: &PageRequest| {
        let items = posts
            .iter()
            .filter(|e| match &request.before {
                Some(before) => e.get("created_at").and_then(|v| v.as_str()) < Some(before.as_str()),
                None => true,
            })
            .take(request.limit)
            .cloned()
            .collect();
        Ok(PageResponse {
            items,
            next_cursor: None,
        })
    }
}

#[tokio::test]
async fn first_page_replaces_collection() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));

    let outcome = h.engine.load_initial(&key).await.unwrap();

    assert_eq!(outcome, LoadOutcome::Loaded { added: 3 });
    assert_eq!(h.ids(&key), vec!["c9", "c8", "c7"]);
    let page = h.engine.state(Domain::Confessions).page(&key).unwrap();
    assert!(page.has_more);
    assert_eq!(page.cursor, Some(Cursor(stamp(7))));
    assert_eq!(
        h.remote.fetches(),
        vec![PageRequest {
            collection: key.clone(),
            before: None,
            limit: PAGE,
        }]
    );
}

#[tokio::test]
async fn load_more_appends_the_next_older_page() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.engine.load_initial(&key).await.unwrap();

    let outcome = h.engine.load_more(&key).await.unwrap();

    assert_eq!(outcome, LoadOutcome::Loaded { added: 3 });
    assert_eq!(h.ids(&key), vec!["c9", "c8", "c7", "c6", "c5", "c4"]);
    assert_eq!(h.remote.fetches()[1].before, Some(Cursor(stamp(7))));
}

#[tokio::test]
async fn overlapping_page_skips_known_ids() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.engine.load_initial(&key).await.unwrap();

    // A new post shifted the window: the older page repeats c7.
    let posts = timeline(10);
    h.remote.on_fetch(move |_| {
        Ok(PageResponse {
            items: posts[2..5].to_vec(),
            next_cursor: None,
        })
    });
    let outcome = h.engine.load_more(&key).await.unwrap();

    assert_eq!(outcome, LoadOutcome::Loaded { added: 2 });
    assert_eq!(h.ids(&key), vec!["c9", "c8", "c7", "c6", "c5"]);
}

#[tokio::test]
async fn short_page_ends_the_collection() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(4)));
    h.engine.load_initial(&key).await.unwrap();

    assert_eq!(
        h.engine.load_more(&key).await.unwrap(),
        LoadOutcome::Loaded { added: 1 }
    );
    assert!(!h.engine.state(Domain::Confessions).page(&key).unwrap().has_more);

    assert_eq!(h.engine.load_more(&key).await.unwrap(), LoadOutcome::Exhausted);
    assert_eq!(h.remote.fetches().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn overlapping_load_more_calls_fetch_once() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.engine.load_initial(&key).await.unwrap();
    h.remote.delay_fetches(Duration::from_millis(300));

    let (first, second) = tokio::join!(h.engine.load_more(&key), h.engine.load_more(&key));

    assert_eq!(first.unwrap(), LoadOutcome::Loaded { added: 3 });
    assert_eq!(second.unwrap(), LoadOutcome::AlreadyLoading);
    assert_eq!(h.remote.fetches().len(), 2);
    assert_eq!(h.ids(&key).len(), 6);
    assert!(!h.engine.state(Domain::Confessions).page(&key).unwrap().is_loading_more);
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_loads_share_one_fetch() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.remote.delay_fetches(Duration::from_millis(300));

    let (first, second) = tokio::join!(h.engine.load_initial(&key), h.engine.load_initial(&key));

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(h.remote.fetches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn older_page_landing_after_reload_is_dropped() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.engine.load_initial(&key).await.unwrap();
    h.remote.delay_fetches(Duration::from_millis(300));

    let reload = async {
        // The older page is already on the wire; this reload overtakes it.
        h.remote.delay_fetches(Duration::from_millis(50));
        h.engine.refresh(&key, true).await
    };
    let (more, reloaded) = tokio::join!(h.engine.load_more(&key), reload);

    assert_eq!(reloaded.unwrap(), LoadOutcome::Loaded { added: 3 });
    assert_eq!(more.unwrap(), LoadOutcome::Superseded);
    assert_eq!(h.ids(&key), vec!["c9", "c8", "c7"]);
    let page = h.engine.state(Domain::Confessions).page(&key).unwrap();
    assert_eq!(page.cursor, Some(Cursor(stamp(7))));
    assert!(!page.is_loading_more);
    assert_eq!(h.remote.fetches().len(), 3);

    assert_eq!(
        h.engine.load_more(&key).await.unwrap(),
        LoadOutcome::Loaded { added: 3 }
    );
}

#[tokio::test]
async fn refresh_respects_the_staleness_window() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.engine.load_initial(&key).await.unwrap();

    assert_eq!(h.engine.refresh(&key, false).await.unwrap(), LoadOutcome::Fresh);
    assert_eq!(h.remote.fetches().len(), 1);

    h.engine.refresh(&key, true).await.unwrap();
    assert_eq!(h.remote.fetches().len(), 2);

    assert!(h.engine.invalidate(&key));
    h.engine.refresh(&key, false).await.unwrap();
    assert_eq!(h.remote.fetches().len(), 3);
    assert_eq!(h.engine.refresh(&key, false).await.unwrap(), LoadOutcome::Fresh);
}

#[tokio::test]
async fn refresh_keeps_unsent_placeholders() {
    let h = paged(false);
    let key = confessions();
    h.seed(&key, vec![post("a", 0)]);
    let created = h
        .engine
        .create(&key, fields(json!({"body": "queued"})))
        .await
        .unwrap();
    let temp = created.entity().unwrap().id.clone();

    h.connectivity.set_online(true);
    h.remote.on_fetch(serve(timeline(10)));
    // Keep the create queued while the page reloads.
    h.remote
        .on_write(|_| Err(RemoteError::transient("still flaky")));
    h.engine.refresh(&key, true).await.unwrap();

    let ids = h.ids(&key);
    assert_eq!(ids[0], temp.to_string());
    assert_eq!(&ids[1..], ["c9", "c8", "c7"]);
}

#[tokio::test]
async fn failed_load_more_keeps_cursor_and_releases_guard() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));
    h.engine.load_initial(&key).await.unwrap();

    h.remote
        .on_fetch(|_| Err(RemoteError::from_code("503", "unavailable")));
    let err = h.engine.load_more(&key).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Remote(RemoteError {
            kind: RemoteErrorKind::Transient,
            ..
        })
    ));

    let page = h.engine.state(Domain::Confessions).page(&key).unwrap();
    assert_eq!(page.cursor, Some(Cursor(stamp(7))));
    assert!(!page.is_loading_more);

    h.remote.on_fetch(serve(timeline(10)));
    assert_eq!(
        h.engine.load_more(&key).await.unwrap(),
        LoadOutcome::Loaded { added: 3 }
    );
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_times_out() {
    let h = paged(true);
    let key = confessions();
    h.remote.delay_fetches(Duration::from_secs(60));

    let err = h.engine.load_initial(&key).await.unwrap_err();

    assert!(matches!(
        err,
        SyncError::Remote(RemoteError {
            kind: RemoteErrorKind::Timeout,
            ..
        })
    ));
    assert!(h.engine.state(Domain::Confessions).page(&key).is_none());
}

#[tokio::test]
async fn load_more_before_first_page_loads_it() {
    let h = paged(true);
    let key = confessions();
    h.remote.on_fetch(serve(timeline(10)));

    let outcome = h.engine.load_more(&key).await.unwrap();

    assert_eq!(outcome, LoadOutcome::Loaded { added: 3 });
    assert_eq!(h.remote.fetches()[0].before, None);
}

#[tokio::test]
async fn loading_while_offline_is_refused() {
    let h = paged(false);
    let key = confessions();

    assert!(matches!(
        h.engine.load_initial(&key).await.unwrap_err(),
        SyncError::Offline
    ));
    assert!(matches!(
        h.engine.load_more(&key).await.unwrap_err(),
        SyncError::Offline
    ));
    assert!(h.remote.fetches().is_empty());
}
