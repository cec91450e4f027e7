use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Counter field patched by like toggles.
pub const LIKES_FIELD: &str = "likes";
/// Per-viewer flag flipped by like toggles.
pub const LIKED_FIELD: &str = "is_liked";
/// Field used to derive a pagination boundary when the service omits one.
pub const CREATED_AT_FIELD: &str = "created_at";

const TEMP_ID_PREFIX: &str = "temp-";

// ============================================================================
// EntityId
// ============================================================================

/// Identity of an entity: either assigned by the remote service or a local
/// placeholder (`temp-<timestamp>-<random>`) used until the create is
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityId {
    Stable(String),
    Temp(String),
}

impl EntityId {
    /// Parse an ID string, recognising the temp prefix.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with(TEMP_ID_PREFIX) {
            Self::Temp(raw)
        } else {
            Self::Stable(raw)
        }
    }

    pub fn stable(raw: impl Into<String>) -> Self {
        Self::Stable(raw.into())
    }

    /// Generate a fresh temporary ID.
    pub fn new_temp() -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self::Temp(format!(
            "{TEMP_ID_PREFIX}{}-{}",
            Utc::now().timestamp(),
            &random[..9]
        ))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stable(s) | Self::Temp(s) => s,
        }
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self::parse(raw)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        match id {
            EntityId::Stable(s) | EntityId::Temp(s) => s,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entity
// ============================================================================

/// A post, reply, notification or trending item.
///
/// Fields are kept as loose JSON; the engine only interprets the handful of
/// fields it patches (see [`LIKES_FIELD`], [`LIKED_FIELD`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build an entity from a JSON value. Non-object values yield no fields.
    pub fn from_value(id: impl Into<EntityId>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn counter(&self, field: &str) -> i64 {
        self.fields.get(field).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn flag(&self, field: &str) -> bool {
        self.fields
            .get(field)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Overlay `patch` onto the entity. Fields absent from `patch` are left
    /// untouched. Returns whether anything changed.
    pub fn patch(&mut self, patch: &Map<String, Value>) -> bool {
        let mut changed = false;
        for (field, value) in patch {
            if self.fields.get(field) != Some(value) {
                self.fields.insert(field.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

// ============================================================================
// Domain / CollectionKey
// ============================================================================

/// The state containers owned by the engine, one per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Confessions,
    Replies,
    Notifications,
    Trending,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Confessions,
        Domain::Replies,
        Domain::Notifications,
        Domain::Trending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confessions => "confessions",
            Self::Replies => "replies",
            Self::Notifications => "notifications",
            Self::Trending => "trending",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one ordered collection inside a domain, e.g. the replies under
/// a given confession.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionKey {
    pub domain: Domain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl CollectionKey {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            scope: None,
        }
    }

    pub fn scoped(domain: Domain, scope: impl Into<String>) -> Self {
        Self {
            domain,
            scope: Some(scope.into()),
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}", self.domain, scope),
            None => write!(f, "{}", self.domain),
        }
    }
}

// ============================================================================
// Cursor / CollectionPage
// ============================================================================

/// Opaque pagination boundary marking the oldest item loaded so far.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    /// Boundary just past `entity`: its creation timestamp when present,
    /// otherwise its ID.
    pub fn after(entity: &Entity) -> Self {
        match entity.get(CREATED_AT_FIELD).and_then(Value::as_str) {
            Some(ts) => Self(ts.to_string()),
            None => Self(entity.id.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Loaded window of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionPage {
    pub items: Vec<Entity>,
    pub has_more: bool,
    pub cursor: Option<Cursor>,
    /// Transient guard flag; never persisted.
    #[serde(skip)]
    pub is_loading_more: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stale: bool,
}

impl CollectionPage {
    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|e| &e.id == id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.position(id).is_some()
    }

    /// Whether the page may be served without a network round-trip.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.fetched_at {
            Some(at) => !self.stale && now - at < window,
            None => false,
        }
    }

    /// Drop the oldest entries beyond `max` from memory. The cursor moves to
    /// the new oldest item so the dropped entries can be paged back in.
    /// Returns the number of entries dropped.
    pub fn enforce_window(&mut self, max: usize) -> usize {
        if self.items.len() <= max {
            return 0;
        }
        let dropped = self.items.len() - max;
        self.items.truncate(max);
        self.cursor = self.items.last().map(Cursor::after);
        self.has_more = true;
        dropped
    }
}

// ============================================================================
// EntitySnapshot
// ============================================================================

/// Pre-mutation state of one entity in one collection, captured before an
/// optimistic write so it can be restored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntitySnapshot {
    /// The entity existed at `index` with exactly this value.
    Present {
        collection: CollectionKey,
        index: usize,
        entity: Entity,
    },
    /// The entity did not exist (it was created optimistically).
    Absent {
        collection: CollectionKey,
        id: EntityId,
    },
}

impl EntitySnapshot {
    pub fn collection(&self) -> &CollectionKey {
        match self {
            Self::Present { collection, .. } | Self::Absent { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            Self::Present { entity, .. } => &entity.id,
            Self::Absent { id, .. } => id,
        }
    }

    /// Rewrite the captured ID after a temp entity has been reconciled.
    pub fn remap_id(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let id = match self {
            Self::Present { entity, .. } => &mut entity.id,
            Self::Absent { id, .. } => id,
        };
        if id == from {
            *id = to.clone();
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
