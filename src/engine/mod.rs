//! SyncEngine — the facade the UI layer talks to.
//!
//! Owns every piece of per-store state: the domain containers, the offline
//! queue, the deduplicators, the subscription handles and the background
//! tasks (merge loop, connectivity watcher). Nothing lives in process
//! globals; dropping or disposing the engine tears all of it down.

pub mod connectivity;
pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::applier::{MutationIntent, MutationOutcome, OptimisticApplier};
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::error::{Result, StorageError, SyncError};
use crate::pagination::{LoadOutcome, PaginatedCache};
use crate::queue::{drain, DrainReport, OfflineQueue, PendingAction};
use crate::realtime::{spawn_merge_loop, MergeHandle, SubscriptionManager, SubscriptionState};
use crate::remote::{ChangeFeed, Connectivity, RemoteService};
use crate::state::{Containers, EventEmitter, ListenerId, StateContainer};
use crate::storage::{PersistedState, StorageBackend};
use crate::types::{CollectionKey, Domain, Entity, EntityId};

pub use events::{DiscardReason, EngineEvent, RollbackReason};

const DRAIN_KEY: &str = "queue-drain";

pub struct SyncEngineOptions {
    pub remote: Arc<dyn RemoteService>,
    pub feed: Arc<dyn ChangeFeed>,
    pub connectivity: Connectivity,
    /// Where the queue and collection snapshots persist. In-memory only
    /// when `None`.
    pub storage: Option<Arc<dyn StorageBackend>>,
    pub config: Option<EngineConfig>,
}

/// What [`SyncEngine::restore`] brought back from storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub collections: usize,
    pub queued_actions: usize,
}

pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    state: Arc<Containers>,
    queue: Arc<OfflineQueue>,
    applier: OptimisticApplier,
    pagination: PaginatedCache,
    subscriptions: SubscriptionManager,
    merge: MergeHandle,
    events: Arc<EventEmitter<EngineEvent>>,
    connectivity: Connectivity,
    drains: Deduplicator<DrainReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SyncEngine {
    /// Build the engine, restore persisted state and start its background
    /// tasks. Must be called inside a Tokio runtime.
    ///
    /// Unreadable persisted state is logged and the engine starts empty.
    pub fn new(options: SyncEngineOptions) -> Self {
        let config = options.config.unwrap_or_default();
        let persistence = options.storage.map(|backend| {
            Arc::new(PersistedState::new(backend, config.storage_namespace.clone()))
        });

        let state = Arc::new(Containers::new(persistence.clone()));
        let queue = Arc::new(OfflineQueue::new(
            persistence,
            config.queue_max_attempts,
            config.queue_max_age(),
        ));
        let events = Arc::new(EventEmitter::new());

        let applier = OptimisticApplier::new(
            Arc::clone(&options.remote),
            Arc::clone(&state),
            Arc::clone(&queue),
            options.connectivity.clone(),
            Arc::clone(&events),
            config.mutation_timeout(),
            config.realtime_window,
        );
        let pagination = PaginatedCache::new(
            options.remote,
            Arc::clone(&state),
            options.connectivity.clone(),
            config.page_size,
            config.staleness_window(),
            config.mutation_timeout(),
        );
        let (merge, merge_task) = spawn_merge_loop(
            Arc::clone(&state),
            config.realtime_window,
            config.merge_channel_capacity,
        );
        let subscriptions = SubscriptionManager::new(
            options.feed,
            merge.clone(),
            Arc::clone(&events),
            config.backoff_base(),
            config.backoff_max(),
            config.connect_timeout(),
        );

        let inner = Arc::new(EngineInner {
            config,
            state,
            queue,
            applier,
            pagination,
            subscriptions,
            merge,
            events,
            connectivity: options.connectivity,
            drains: Deduplicator::new(),
            tasks: Mutex::new(vec![merge_task]),
            disposed: AtomicBool::new(false),
        });

        let engine = Self { inner };
        if let Err(e) = engine.restore() {
            tracing::warn!(error = %e, "failed to restore persisted state; starting empty");
        }

        let watcher = connectivity::spawn_connectivity_watcher(
            Arc::downgrade(&engine.inner),
            engine.inner.connectivity.subscribe(),
        );
        engine.inner.tasks.lock().push(watcher);

        // Actions restored from a previous run drain as soon as we can.
        if engine.inner.connectivity.is_online() && !engine.inner.queue.is_empty() {
            engine.spawn_drain();
        }
        engine
    }

    /// Load the persisted queue and collection snapshots, preserving order
    /// and IDs. Called by [`new`](Self::new).
    pub fn restore(&self) -> Result<RestoreReport, StorageError> {
        let collections = self.inner.state.load_persisted()?;
        let queued_actions = self.inner.queue.restore()?;
        tracing::debug!(collections, queued_actions, "restored persisted state");
        Ok(RestoreReport {
            collections,
            queued_actions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    // -----------------------------------------------------------------------
    // State getters
    // -----------------------------------------------------------------------

    pub fn state(&self, domain: Domain) -> &StateContainer {
        self.inner.state.get(domain)
    }

    pub fn items(&self, key: &CollectionKey) -> Vec<Entity> {
        self.inner.state.for_key(key).items(key)
    }

    pub fn get(&self, key: &CollectionKey, id: &EntityId) -> Option<Entity> {
        self.inner.state.for_key(key).get(key, id)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn toggle_like(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
    ) -> Result<MutationOutcome> {
        self.mutate(MutationIntent::ToggleLike {
            collection: collection.clone(),
            id: id.clone(),
        })
        .await
    }

    pub async fn create(
        &self,
        collection: &CollectionKey,
        fields: Map<String, Value>,
    ) -> Result<MutationOutcome> {
        self.mutate(MutationIntent::Create {
            collection: collection.clone(),
            fields,
        })
        .await
    }

    pub async fn edit(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
        patch: Map<String, Value>,
    ) -> Result<MutationOutcome> {
        self.mutate(MutationIntent::Edit {
            collection: collection.clone(),
            id: id.clone(),
            patch,
        })
        .await
    }

    pub async fn remove(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
    ) -> Result<MutationOutcome> {
        self.mutate(MutationIntent::Remove {
            collection: collection.clone(),
            id: id.clone(),
        })
        .await
    }

    pub async fn mutate(&self, intent: MutationIntent) -> Result<MutationOutcome> {
        self.inner.ensure_live()?;
        let is_create = matches!(intent, MutationIntent::Create { .. });
        let outcome = self.inner.applier.apply(intent).await?;

        // Writes made against the placeholder were queued behind it.
        if is_create && outcome.is_applied() && !self.inner.queue.is_empty() {
            self.spawn_drain();
        }
        Ok(outcome)
    }

    fn spawn_drain(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.drain().await {
                tracing::debug!(error = %e, "background drain did not run");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Offline queue
    // -----------------------------------------------------------------------

    /// Run a drain pass now, or join the one already running.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        self.inner.ensure_live()?;
        self.inner.drain().await
    }

    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.inner.queue.snapshot()
    }

    // -----------------------------------------------------------------------
    // Realtime
    // -----------------------------------------------------------------------

    /// Subscribe to changes for `resource`. Returns `false` if already
    /// subscribed.
    pub fn subscribe(&self, resource: &CollectionKey) -> Result<bool> {
        self.inner.ensure_live()?;
        Ok(self.inner.subscriptions.subscribe(resource))
    }

    pub fn unsubscribe(&self, resource: &CollectionKey) -> Option<SubscriptionState> {
        self.inner.subscriptions.unsubscribe(resource)
    }

    pub fn subscription_state(&self, resource: &CollectionKey) -> Option<SubscriptionState> {
        self.inner.subscriptions.state(resource)
    }

    pub fn watch_subscription(
        &self,
        resource: &CollectionKey,
    ) -> Option<watch::Receiver<SubscriptionState>> {
        self.inner.subscriptions.watch(resource)
    }

    /// Wait until every realtime event received so far has been merged.
    pub async fn settle(&self) {
        self.inner.merge.barrier().await;
    }

    // -----------------------------------------------------------------------
    // Pagination
    // -----------------------------------------------------------------------

    pub async fn load_initial(&self, key: &CollectionKey) -> Result<LoadOutcome> {
        self.inner.ensure_live()?;
        self.inner.pagination.load_initial(key).await
    }

    pub async fn load_more(&self, key: &CollectionKey) -> Result<LoadOutcome> {
        self.inner.ensure_live()?;
        self.inner.pagination.load_more(key).await
    }

    pub async fn refresh(&self, key: &CollectionKey, force: bool) -> Result<LoadOutcome> {
        self.inner.ensure_live()?;
        self.inner.pagination.refresh(key, force).await
    }

    pub fn invalidate(&self, key: &CollectionKey) -> bool {
        self.inner.pagination.invalidate(key)
    }

    // -----------------------------------------------------------------------
    // Events / lifecycle
    // -----------------------------------------------------------------------

    pub fn on_event(&self, listener: impl Fn(&EngineEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(listener)
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Tear down every subscription and background task. Later calls fail
    /// with [`SyncError::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        self.inner.shutdown();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl EngineInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.events.emit(&event);
    }

    pub(crate) async fn drain(&self) -> Result<DrainReport> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        self.drains
            .run(DRAIN_KEY, || async { Ok(drain::drain(&self.applier).await) })
            .await
    }

    fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscriptions.unsubscribe_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.events.clear();
        self.state.clear_listeners();
        tracing::debug!("sync engine disposed");
    }
}
