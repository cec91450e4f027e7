//! Paginated Collection Cache — cursor-based incremental loading.
//!
//! `load_initial` replaces a collection with its newest page; `load_more`
//! appends the next older page. A page shorter than `page_size` marks the
//! end of the collection. Only one `load_more` per collection is in flight:
//! the guard flag lives on the page itself, so overlapping calls return
//! [`LoadOutcome::AlreadyLoading`] without touching the network.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::dedup::Deduplicator;
use crate::error::{Result, SyncError};
use crate::remote::{Connectivity, PageRequest, PageResponse, RemoteError, RemoteService};
use crate::state::{Containers, LoadMoreGate, StateContainer};
use crate::types::{CollectionKey, Cursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched; `added` entries are new to the collection.
    Loaded { added: usize },
    /// The cached page is within the staleness window; no fetch was made.
    Fresh,
    /// Another `load_more` for the same collection is in flight.
    AlreadyLoading,
    /// The last fetch returned a short page.
    Exhausted,
    /// The collection was reloaded while this page was in flight; the page
    /// was dropped.
    Superseded,
}

pub struct PaginatedCache {
    remote: Arc<dyn RemoteService>,
    state: Arc<Containers>,
    connectivity: Connectivity,
    page_size: usize,
    staleness_window: chrono::Duration,
    request_timeout: Duration,
    initial: Deduplicator<LoadOutcome>,
}

impl PaginatedCache {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        state: Arc<Containers>,
        connectivity: Connectivity,
        page_size: usize,
        staleness_window: chrono::Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            state,
            connectivity,
            page_size: page_size.max(1),
            staleness_window,
            request_timeout,
            initial: Deduplicator::new(),
        }
    }

    /// Fetch the newest page and replace the collection with it. Concurrent
    /// calls for the same collection share one fetch.
    pub async fn load_initial(&self, key: &CollectionKey) -> Result<LoadOutcome> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        let dedup_key = format!("initial:{key}");
        self.initial
            .run(&dedup_key, || async {
                let response = self.fetch(key, None).await?;
                let has_more = response.items.len() >= self.page_size;
                let cursor = next_cursor(&response);
                let added = self.container(key).replace_page(
                    key,
                    response.items,
                    cursor,
                    has_more,
                    Utc::now(),
                );
                tracing::debug!(collection = %key, added, has_more, "loaded first page");
                Ok(LoadOutcome::Loaded { added })
            })
            .await
    }

    /// Fetch the page strictly older than the current boundary and append
    /// it, skipping IDs already present. Falls back to `load_initial` when
    /// the collection has never been loaded.
    pub async fn load_more(&self, key: &CollectionKey) -> Result<LoadOutcome> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        let container = self.container(key);
        match container.begin_load_more(key) {
            LoadMoreGate::NotLoaded => return self.load_initial(key).await,
            LoadMoreGate::InFlight => return Ok(LoadOutcome::AlreadyLoading),
            LoadMoreGate::Exhausted => return Ok(LoadOutcome::Exhausted),
            LoadMoreGate::Started => {}
        }
        let _guard = LoadMoreGuard { container, key };

        let (before, base) = match container.page(key) {
            Some(page) => (
                page.cursor
                    .clone()
                    .or_else(|| page.items.last().map(Cursor::after)),
                page.fetched_at,
            ),
            None => (None, None),
        };
        let response = self.fetch(key, before).await?;
        let has_more = response.items.len() >= self.page_size;
        let cursor = next_cursor(&response);
        match container.append_page(key, response.items, cursor, has_more, base) {
            Some(added) => {
                tracing::debug!(collection = %key, added, has_more, "appended older page");
                Ok(LoadOutcome::Loaded { added })
            }
            None => {
                tracing::debug!(collection = %key, "collection reloaded mid-fetch; page dropped");
                Ok(LoadOutcome::Superseded)
            }
        }
    }

    /// Reload the first page unless the cached one is still fresh.
    /// `force` skips the freshness check.
    pub async fn refresh(&self, key: &CollectionKey, force: bool) -> Result<LoadOutcome> {
        if !force {
            let fresh = self
                .container(key)
                .page(key)
                .is_some_and(|page| page.is_fresh(Utc::now(), self.staleness_window));
            if fresh {
                return Ok(LoadOutcome::Fresh);
            }
        }
        self.load_initial(key).await
    }

    /// Stop trusting the cached page; the next `refresh` goes to the network.
    pub fn invalidate(&self, key: &CollectionKey) -> bool {
        self.container(key).mark_stale(key)
    }

    fn container(&self, key: &CollectionKey) -> &StateContainer {
        self.state.for_key(key)
    }

    async fn fetch(&self, key: &CollectionKey, before: Option<Cursor>) -> Result<PageResponse> {
        let request = PageRequest {
            collection: key.clone(),
            before,
            limit: self.page_size,
        };
        match tokio::time::timeout(self.request_timeout, self.remote.fetch_page(&request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RemoteError::timeout(self.request_timeout.as_millis() as u64).into()),
        }
    }
}

/// Boundary for the next page: the service's, or one derived from the
/// oldest item returned.
fn next_cursor(response: &PageResponse) -> Option<Cursor> {
    response
        .next_cursor
        .clone()
        .or_else(|| response.items.last().map(Cursor::after))
}

/// Releases the per-collection `load_more` flag on every exit path.
struct LoadMoreGuard<'a> {
    container: &'a StateContainer,
    key: &'a CollectionKey,
}

impl Drop for LoadMoreGuard<'_> {
    fn drop(&mut self) {
        self.container.end_load_more(self.key);
    }
}
