//! Storage backend trait for persisted engine state.
//!
//! Backends are plain namespaced key/value stores. Keys are `/`-separated
//! paths; values are serialized JSON documents produced by
//! [`PersistedState`](super::persisted::PersistedState).

use crate::error::StorageError;

/// Low-level storage backend: raw string I/O with no engine semantics.
///
/// Implementors must be `Send + Sync` so they can be shared across the
/// engine's background tasks. Calls are synchronous and expected to be fast
/// (local disk or memory).
pub trait StorageBackend: Send + Sync {
    /// Read the value stored under `key`, or `None` when absent.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Insert or replace the value under `key`.
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
