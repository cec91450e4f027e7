use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// RemoteErrorKind / RemoteError
// ---------------------------------------------------------------------------

/// Classification of a failure reported by the remote data service.
///
/// Derived from the service's error codes (see [`RemoteError::from_code`]),
/// never from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Network failure or temporary unavailability.
    Transient,
    /// The call did not settle within the configured timeout.
    Timeout,
    /// The session is missing or expired.
    Unauthenticated,
    /// The write conflicts with server state (duplicate key, stale edit).
    Conflict,
    /// The target entity does not exist remotely.
    NotFound,
    /// Validated and refused for any other reason.
    Rejected,
}

impl RemoteErrorKind {
    /// Transient failures may be retried through the offline queue.
    /// Every other kind is an authoritative rejection.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Unauthenticated => "unauthenticated",
            Self::Conflict => "conflict",
            Self::NotFound => "not found",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Failure returned by a [`RemoteService`](crate::remote::RemoteService) or
/// [`ChangeFeed`](crate::remote::ChangeFeed) call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Remote {kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    /// Service error code (HTTP status or database error code), when known.
    pub code: Option<String>,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            RemoteErrorKind::Timeout,
            format!("no response within {after_ms}ms"),
        )
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }

    /// Build an error from a service error code.
    ///
    /// HTTP statuses and the PostgREST / Postgres codes the backing service
    /// emits are mapped onto [`RemoteErrorKind`]. Unknown codes are treated as
    /// authoritative rejections.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let kind = classify_code(&code);
        Self {
            kind,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

fn classify_code(code: &str) -> RemoteErrorKind {
    match code {
        "401" | "403" | "PGRST301" | "PGRST302" | "42501" => RemoteErrorKind::Unauthenticated,
        "409" | "23505" | "40001" => RemoteErrorKind::Conflict,
        "404" | "PGRST116" => RemoteErrorKind::NotFound,
        "408" | "504" | "57014" => RemoteErrorKind::Timeout,
        "429" | "500" | "502" | "503" | "08000" | "08003" | "08006" => RemoteErrorKind::Transient,
        _ => RemoteErrorKind::Rejected,
    }
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to serialize \"{key}\": {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stored value under \"{key}\" is corrupt: {source}")]
    Corruption {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// SyncError — top-level rollup
// ---------------------------------------------------------------------------

/// Error surfaced to callers of the engine.
///
/// `Clone` so that a single settled result can be handed to every caller
/// joined on the same deduplication key.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(Arc<StorageError>),

    #[error("Entity {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("Device is offline")]
    Offline,

    #[error("Operation \"{key}\" was abandoned before it settled")]
    Abandoned { key: String },

    #[error("Sync engine is disposed")]
    Disposed,
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        Self::Storage(Arc::new(e))
    }
}

/// The default error type is `SyncError`.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
