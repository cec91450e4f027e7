//! StateContainer — the in-memory collections of one domain.
//!
//! Each collection sits behind its own `parking_lot::Mutex`, so writes to
//! unrelated collections never serialize against each other. Every write is
//! a short synchronous critical section: readers observe either the state
//! before it or after it, never a partial merge.
//!
//! ## Lock ordering
//!
//! 1. `pages` (the key → page map)
//! 2. an individual page
//!
//! The map lock is only held long enough to clone a page handle; no method
//! acquires the map lock while holding a page lock.
//!
//! Change events are emitted after the page lock is released. The page is
//! persisted while the lock is still held so snapshots hit storage in the
//! same order the writes happened.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::StorageError;
use crate::storage::PersistedState;
use crate::types::{
    CollectionKey, CollectionPage, Cursor, Domain, Entity, EntityId, EntitySnapshot,
};

use super::event::ChangeEvent;
use super::event_emitter::{EventEmitter, ListenerId};

type PageHandle = Arc<Mutex<CollectionPage>>;

/// Result of asking to start a `load_more` on a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMoreGate {
    /// The guard flag was set; the caller must fetch and then release it.
    Started,
    /// Another `load_more` is already in flight.
    InFlight,
    /// The last fetch returned a short page.
    Exhausted,
    /// The collection has never been loaded.
    NotLoaded,
}

pub struct StateContainer {
    domain: Domain,
    pages: Mutex<HashMap<CollectionKey, PageHandle>>,
    changes: EventEmitter<ChangeEvent>,
    persistence: Option<Arc<PersistedState>>,
}

impl StateContainer {
    pub fn new(domain: Domain, persistence: Option<Arc<PersistedState>>) -> Self {
        Self {
            domain,
            pages: Mutex::new(HashMap::new()),
            changes: EventEmitter::new(),
            persistence,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn keys(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self.pages.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn page(&self, key: &CollectionKey) -> Option<CollectionPage> {
        self.handle(key).map(|h| h.lock().clone())
    }

    pub fn items(&self, key: &CollectionKey) -> Vec<Entity> {
        self.handle(key)
            .map(|h| h.lock().items.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &CollectionKey, id: &EntityId) -> Option<Entity> {
        let handle = self.handle(key)?;
        let page = handle.lock();
        let found = page.items.iter().find(|e| &e.id == id).cloned();
        found
    }

    pub fn contains(&self, key: &CollectionKey, id: &EntityId) -> bool {
        self.handle(key)
            .map(|h| h.lock().contains(id))
            .unwrap_or(false)
    }

    /// Capture the current state of `id` in `key` for a later [`restore`].
    ///
    /// [`restore`]: Self::restore
    pub fn snapshot(&self, key: &CollectionKey, id: &EntityId) -> EntitySnapshot {
        let found = self.handle(key).and_then(|h| {
            let page = h.lock();
            page.position(id).map(|index| (index, page.items[index].clone()))
        });
        match found {
            Some((index, entity)) => EntitySnapshot::Present {
                collection: key.clone(),
                index,
                entity,
            },
            None => EntitySnapshot::Absent {
                collection: key.clone(),
                id: id.clone(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Entity writes
    // -----------------------------------------------------------------------

    /// Insert `entity` at the top unless an entry with its ID exists, then
    /// trim the collection to `window` entries. Returns whether it was
    /// inserted.
    pub fn insert_front(
        &self,
        key: &CollectionKey,
        entity: Entity,
        window: Option<usize>,
    ) -> bool {
        self.write(key, |page| {
            if page.contains(&entity.id) {
                return (false, Vec::new());
            }
            let id = entity.id.clone();
            page.items.insert(0, entity);
            if let Some(max) = window {
                let dropped = page.enforce_window(max);
                if dropped > 0 {
                    tracing::debug!(collection = %key, dropped, "trimmed collection to window");
                }
            }
            (
                true,
                vec![ChangeEvent::Inserted {
                    collection: key.clone(),
                    id,
                }],
            )
        })
    }

    /// Overlay `fields` onto the entity with `id`. Fields not carried are left
    /// untouched. Returns the resulting entity, or `None` when absent.
    pub fn patch(
        &self,
        key: &CollectionKey,
        id: &EntityId,
        fields: &Map<String, Value>,
    ) -> Option<Entity> {
        self.write_existing(key, |page| {
            let Some(entity) = page.items.iter_mut().find(|e| &e.id == id) else {
                return (None, Vec::new());
            };
            let changed = entity.patch(fields);
            let events = if changed {
                vec![ChangeEvent::Updated {
                    collection: key.clone(),
                    id: id.clone(),
                }]
            } else {
                Vec::new()
            };
            (Some(entity.clone()), events)
        })
    }

    /// Compute a patch from the current value of `id` and apply it in the
    /// same critical section. Returns the pre-write snapshot and the new
    /// value, or `None` when absent.
    pub fn patch_with(
        &self,
        key: &CollectionKey,
        id: &EntityId,
        compute: impl FnOnce(&Entity) -> Map<String, Value>,
    ) -> Option<(EntitySnapshot, Entity)> {
        self.write_existing(key, |page| {
            let Some(index) = page.position(id) else {
                return (None, Vec::new());
            };
            let before = page.items[index].clone();
            let fields = compute(&before);
            let entity = &mut page.items[index];
            let events = if entity.patch(&fields) {
                vec![ChangeEvent::Updated {
                    collection: key.clone(),
                    id: id.clone(),
                }]
            } else {
                Vec::new()
            };
            let snapshot = EntitySnapshot::Present {
                collection: key.clone(),
                index,
                entity: before,
            };
            (Some((snapshot, entity.clone())), events)
        })
    }

    /// Replace the entry with `entity.id` in place. Returns whether an entry
    /// was found.
    pub fn replace(&self, key: &CollectionKey, entity: Entity) -> bool {
        self.write_existing(key, |page| {
            let Some(index) = page.position(&entity.id) else {
                return (false, Vec::new());
            };
            if page.items[index] == entity {
                return (true, Vec::new());
            }
            let id = entity.id.clone();
            page.items[index] = entity;
            (
                true,
                vec![ChangeEvent::Updated {
                    collection: key.clone(),
                    id,
                }],
            )
        })
    }

    /// Remove the entry with `id`, returning its former position and value.
    pub fn remove(&self, key: &CollectionKey, id: &EntityId) -> Option<(usize, Entity)> {
        self.write_existing(key, |page| {
            let Some(index) = page.position(id) else {
                return (None, Vec::new());
            };
            let entity = page.items.remove(index);
            (
                Some((index, entity)),
                vec![ChangeEvent::Removed {
                    collection: key.clone(),
                    id: id.clone(),
                }],
            )
        })
    }

    /// Put the collection back exactly as `snapshot` recorded it for that
    /// entity: the captured value at its captured position, or no entry at
    /// all.
    pub fn restore(&self, snapshot: &EntitySnapshot) {
        let key = snapshot.collection().clone();
        self.write(&key, |page| {
            match snapshot {
                EntitySnapshot::Present { index, entity, .. } => match page.position(&entity.id) {
                    Some(current) => page.items[current] = entity.clone(),
                    None => {
                        let at = (*index).min(page.items.len());
                        page.items.insert(at, entity.clone());
                    }
                },
                EntitySnapshot::Absent { id, .. } => {
                    page.items.retain(|e| &e.id != id);
                }
            }
            (
                (),
                vec![ChangeEvent::RolledBack {
                    collection: key.clone(),
                    id: snapshot.id().clone(),
                }],
            )
        });
    }

    /// Replace every entry bearing `temp_id` with `authoritative`, keeping
    /// its position. An entry already carrying the authoritative ID (e.g.
    /// delivered by the change feed first) is dropped so the collection holds
    /// one copy. Emits a single `Reconciled` per collection touched.
    pub fn reconcile(&self, temp_id: &EntityId, authoritative: &Entity) -> Vec<CollectionKey> {
        let mut touched = Vec::new();
        for key in self.keys() {
            let replaced = self.write(&key, |page| {
                let Some(index) = page.position(temp_id) else {
                    return (false, Vec::new());
                };
                page.items[index] = authoritative.clone();
                let mut position = 0;
                page.items.retain(|e| {
                    let keep = e.id != authoritative.id || position == index;
                    position += 1;
                    keep
                });
                (
                    true,
                    vec![ChangeEvent::Reconciled {
                        collection: key.clone(),
                        temp_id: temp_id.clone(),
                        id: authoritative.id.clone(),
                    }],
                )
            });
            if replaced {
                touched.push(key);
            }
        }
        touched
    }

    // -----------------------------------------------------------------------
    // Page writes
    // -----------------------------------------------------------------------

    /// Replace the collection with a freshly fetched first page.
    ///
    /// Temp entries are kept at the top: they exist only locally until their
    /// queued create is acknowledged.
    pub fn replace_page(
        &self,
        key: &CollectionKey,
        items: Vec<Entity>,
        cursor: Option<Cursor>,
        has_more: bool,
        fetched_at: DateTime<Utc>,
    ) -> usize {
        self.write(key, |page| {
            let mut next: Vec<Entity> = page
                .items
                .iter()
                .filter(|e| e.id.is_temp())
                .cloned()
                .collect();
            let count = items.len();
            for entity in items {
                if !next.iter().any(|e| e.id == entity.id) {
                    next.push(entity);
                }
            }
            page.items = next;
            page.cursor = cursor;
            page.has_more = has_more;
            page.fetched_at = Some(fetched_at);
            page.stale = false;
            (
                count,
                vec![ChangeEvent::PageLoaded {
                    collection: key.clone(),
                    added: count,
                }],
            )
        })
    }

    /// Append an older page, skipping IDs already present. The cursor moves
    /// only when the fetch returned items. Returns the number appended.
    ///
    /// `base` is the `fetched_at` of the page the request was built from.
    /// If the collection has been replaced since, nothing is appended and
    /// `None` is returned.
    pub fn append_page(
        &self,
        key: &CollectionKey,
        items: Vec<Entity>,
        cursor: Option<Cursor>,
        has_more: bool,
        base: Option<DateTime<Utc>>,
    ) -> Option<usize> {
        self.write(key, |page| {
            if page.fetched_at != base {
                return (None, Vec::new());
            }
            let mut added = 0;
            for entity in items {
                if !page.contains(&entity.id) {
                    page.items.push(entity);
                    added += 1;
                }
            }
            if cursor.is_some() {
                page.cursor = cursor;
            }
            page.has_more = has_more;
            (
                Some(added),
                vec![ChangeEvent::PageLoaded {
                    collection: key.clone(),
                    added,
                }],
            )
        })
    }

    /// Claim the per-collection `load_more` guard.
    pub fn begin_load_more(&self, key: &CollectionKey) -> LoadMoreGate {
        let Some(handle) = self.handle(key) else {
            return LoadMoreGate::NotLoaded;
        };
        let mut page = handle.lock();
        if page.fetched_at.is_none() {
            LoadMoreGate::NotLoaded
        } else if page.is_loading_more {
            LoadMoreGate::InFlight
        } else if !page.has_more {
            LoadMoreGate::Exhausted
        } else {
            page.is_loading_more = true;
            LoadMoreGate::Started
        }
    }

    pub fn end_load_more(&self, key: &CollectionKey) {
        if let Some(handle) = self.handle(key) {
            handle.lock().is_loading_more = false;
        }
    }

    /// Mark a page as untrusted so the next refresh goes to the network.
    pub fn mark_stale(&self, key: &CollectionKey) -> bool {
        let Some(handle) = self.handle(key) else {
            return false;
        };
        let mut page = handle.lock();
        page.stale = true;
        self.persist(key, &page);
        true
    }

    // -----------------------------------------------------------------------
    // Listeners / persistence
    // -----------------------------------------------------------------------

    pub fn on_change(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> ListenerId {
        self.changes.on(listener)
    }

    pub fn off_change(&self, id: ListenerId) -> bool {
        self.changes.off(id)
    }

    pub(crate) fn clear_listeners(&self) {
        self.changes.clear();
    }

    /// Load persisted pages into memory without emitting events. Returns the
    /// number of collections restored.
    pub fn load_persisted(&self) -> Result<usize, StorageError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let pages = persistence.load_pages(self.domain)?;
        let count = pages.len();
        let mut map = self.pages.lock();
        for (key, page) in pages {
            map.insert(key, Arc::new(Mutex::new(page)));
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn handle(&self, key: &CollectionKey) -> Option<PageHandle> {
        self.pages.lock().get(key).cloned()
    }

    fn handle_or_create(&self, key: &CollectionKey) -> PageHandle {
        self.pages
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CollectionPage::default())))
            .clone()
    }

    /// Run `f` under the page lock. Pages are persisted when `f` reports at
    /// least one change; events are emitted after the lock is released.
    fn write<R>(
        &self,
        key: &CollectionKey,
        f: impl FnOnce(&mut CollectionPage) -> (R, Vec<ChangeEvent>),
    ) -> R {
        let handle = self.handle_or_create(key);
        let (result, events) = {
            let mut page = handle.lock();
            let (result, events) = f(&mut page);
            if !events.is_empty() {
                self.persist(key, &page);
            }
            (result, events)
        };
        for event in &events {
            self.changes.emit(event);
        }
        result
    }

    /// Like [`write`](Self::write) but never creates a page: returns
    /// `R::default()` when the collection does not exist.
    fn write_existing<R: Default>(
        &self,
        key: &CollectionKey,
        f: impl FnOnce(&mut CollectionPage) -> (R, Vec<ChangeEvent>),
    ) -> R {
        if self.handle(key).is_none() {
            return R::default();
        }
        self.write(key, f)
    }

    fn persist(&self, key: &CollectionKey, page: &CollectionPage) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save_page(key, page) {
                tracing::warn!(
                    collection = %key,
                    error = %e,
                    "failed to persist collection snapshot; in-memory state is unaffected"
                );
            }
        }
    }
}
