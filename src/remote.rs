//! Remote collaborators: the data service the engine writes to and reads
//! from, its change feed, and the device connectivity signal.
//!
//! Implementations handle the wire protocol; the engine only sees these
//! types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

pub use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::{CollectionKey, Cursor, Entity, EntityId};

// ============================================================================
// RemoteService — point writes and page reads
// ============================================================================

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Perform a write and return the authoritative result.
    async fn write(&self, mutation: &RemoteMutation) -> Result<WriteAck, RemoteError>;

    /// Fetch one page of a collection, newest first, strictly older than
    /// `request.before` when set.
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, RemoteError>;
}

/// A write as sent to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteMutation {
    /// Idempotent server-side like toggle returning the authoritative count.
    ToggleLike {
        collection: CollectionKey,
        id: EntityId,
        /// Desired state after the toggle.
        liked: bool,
    },
    Create {
        collection: CollectionKey,
        /// Placeholder the entity is known by locally until acknowledged.
        temp_id: EntityId,
        fields: Map<String, Value>,
    },
    Edit {
        collection: CollectionKey,
        id: EntityId,
        patch: Map<String, Value>,
    },
    Remove {
        collection: CollectionKey,
        id: EntityId,
    },
}

impl RemoteMutation {
    pub fn collection(&self) -> &CollectionKey {
        match self {
            Self::ToggleLike { collection, .. }
            | Self::Create { collection, .. }
            | Self::Edit { collection, .. }
            | Self::Remove { collection, .. } => collection,
        }
    }

    /// The entity this write targets (the temp ID for creates).
    pub fn target(&self) -> &EntityId {
        match self {
            Self::ToggleLike { id, .. } | Self::Edit { id, .. } | Self::Remove { id, .. } => id,
            Self::Create { temp_id, .. } => temp_id,
        }
    }

    /// Point the write at `to` if it currently targets `from`.
    pub fn remap_target(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let id = match self {
            Self::ToggleLike { id, .. } | Self::Edit { id, .. } | Self::Remove { id, .. } => id,
            // A create always keeps its own placeholder.
            Self::Create { .. } => return false,
        };
        if id == from {
            *id = to.clone();
            true
        } else {
            false
        }
    }
}

/// Authoritative outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WriteAck {
    /// Full entity as stored remotely.
    Entity(Entity),
    /// Server-computed subset of fields, e.g. a like count.
    Fields(Map<String, Value>),
    /// Accepted with nothing to reconcile.
    Accepted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub collection: CollectionKey,
    pub before: Option<Cursor>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResponse {
    pub items: Vec<Entity>,
    /// Boundary for the next page. Derived from the last item when `None`.
    pub next_cursor: Option<Cursor>,
}

// ============================================================================
// ChangeFeed — push-based subscription per resource
// ============================================================================

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a channel delivering changes to `resource`. Returns once the
    /// service confirms the subscription.
    async fn subscribe(&self, resource: &CollectionKey) -> Result<Channel, RemoteError>;
}

/// An open change-feed channel. Dropping it releases the subscription.
pub struct Channel {
    pub name: String,
    pub messages: mpsc::Receiver<ChannelMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(RealtimeEvent),
    /// The channel reported an error (`CHANNEL_ERROR`).
    Error(String),
    /// The channel stopped responding (`TIMED_OUT`).
    Timeout,
    /// The service closed the channel (`CLOSED`).
    Closed,
}

/// A change pushed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Insert { entity: Entity },
    /// Partial update: only the carried fields changed.
    Update {
        id: EntityId,
        fields: Map<String, Value>,
    },
    Delete { id: EntityId },
}

impl RealtimeEvent {
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Insert { entity } => &entity.id,
            Self::Update { id, .. } | Self::Delete { id } => id,
        }
    }
}

// ============================================================================
// Connectivity
// ============================================================================

/// Online/offline signal shared between the platform layer (which sets it)
/// and the engine (which observes transitions).
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report the current state. Repeating the current value is not a
    /// transition and wakes nobody.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectivity")
            .field("online", &self.is_online())
            .finish()
    }
}
