//! In-process state owned by the engine.
//!
//! # Overview
//!
//! One [`StateContainer`] per [`Domain`]. The engine's components are the
//! only writers; UI code reads through the getters and listens with
//! [`StateContainer::on_change`].
//!
//! # Modules
//!
//! - [`event`] — [`ChangeEvent`].
//! - [`event_emitter`] — typed pub/sub ([`EventEmitter<T>`]).
//! - [`container`] — [`StateContainer`].

pub mod container;
pub mod event;
pub mod event_emitter;

use std::sync::Arc;

pub use container::{LoadMoreGate, StateContainer};
pub use event::ChangeEvent;
pub use event_emitter::{EventEmitter, ListenerId};

use crate::error::StorageError;
use crate::storage::PersistedState;
use crate::types::{CollectionKey, Domain, Entity, EntityId};

/// The four domain containers.
pub struct Containers {
    confessions: StateContainer,
    replies: StateContainer,
    notifications: StateContainer,
    trending: StateContainer,
}

impl Containers {
    pub fn new(persistence: Option<Arc<PersistedState>>) -> Self {
        Self {
            confessions: StateContainer::new(Domain::Confessions, persistence.clone()),
            replies: StateContainer::new(Domain::Replies, persistence.clone()),
            notifications: StateContainer::new(Domain::Notifications, persistence.clone()),
            trending: StateContainer::new(Domain::Trending, persistence),
        }
    }

    pub fn get(&self, domain: Domain) -> &StateContainer {
        match domain {
            Domain::Confessions => &self.confessions,
            Domain::Replies => &self.replies,
            Domain::Notifications => &self.notifications,
            Domain::Trending => &self.trending,
        }
    }

    pub fn for_key(&self, key: &CollectionKey) -> &StateContainer {
        self.get(key.domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateContainer> {
        Domain::ALL.into_iter().map(move |d| self.get(d))
    }

    /// Replace `temp_id` with `authoritative` in every collection of every
    /// domain. Returns the collections touched.
    pub fn reconcile(&self, temp_id: &EntityId, authoritative: &Entity) -> Vec<CollectionKey> {
        self.iter()
            .flat_map(|c| c.reconcile(temp_id, authoritative))
            .collect()
    }

    /// Load every persisted page. Returns the number of collections restored.
    pub fn load_persisted(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for container in self.iter() {
            total += container.load_persisted()?;
        }
        Ok(total)
    }

    pub(crate) fn clear_listeners(&self) {
        for container in self.iter() {
            container.clear_listeners();
        }
    }
}
