//! ChangeEvent — one logical change to a collection.
//!
//! Emitted by [`StateContainer`](super::StateContainer) after the change is
//! visible to readers, exactly once per change.

use crate::types::{CollectionKey, EntityId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// An entity was added to the collection.
    Inserted { collection: CollectionKey, id: EntityId },
    /// Fields of an existing entity changed.
    Updated { collection: CollectionKey, id: EntityId },
    Removed { collection: CollectionKey, id: EntityId },
    /// A temp placeholder was replaced in place by its authoritative entity.
    Reconciled {
        collection: CollectionKey,
        temp_id: EntityId,
        id: EntityId,
    },
    /// An optimistic change was reverted to its snapshot.
    RolledBack { collection: CollectionKey, id: EntityId },
    /// The page was replaced or extended by a fetch.
    PageLoaded {
        collection: CollectionKey,
        added: usize,
    },
}

impl ChangeEvent {
    pub fn collection(&self) -> &CollectionKey {
        match self {
            Self::Inserted { collection, .. }
            | Self::Updated { collection, .. }
            | Self::Removed { collection, .. }
            | Self::Reconciled { collection, .. }
            | Self::RolledBack { collection, .. }
            | Self::PageLoaded { collection, .. } => collection,
        }
    }

    /// The entity affected, if the change concerns a single one.
    pub fn id(&self) -> Option<&EntityId> {
        match self {
            Self::Inserted { id, .. }
            | Self::Updated { id, .. }
            | Self::Removed { id, .. }
            | Self::Reconciled { id, .. }
            | Self::RolledBack { id, .. } => Some(id),
            Self::PageLoaded { .. } => None,
        }
    }
}
