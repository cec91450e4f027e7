//! PersistedState — serializes the offline queue and collection snapshots
//! into a [`StorageBackend`] under a stable namespace.
//!
//! Layout:
//!   - `<ns>/queue` — the full pending-action list, in queue order
//!   - `<ns>/<domain>/collections/<collection key>` — one page per collection

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::queue::PendingAction;
use crate::types::{CollectionKey, CollectionPage, Domain};

use super::traits::StorageBackend;

#[derive(Serialize, Deserialize)]
struct PersistedPage {
    key: CollectionKey,
    page: CollectionPage,
}

pub struct PersistedState {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl PersistedState {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    pub fn save_queue(&self, actions: &[PendingAction]) -> Result<(), StorageError> {
        let key = self.queue_key();
        let json = serde_json::to_string(actions).map_err(|source| StorageError::Serialize {
            key: key.clone(),
            source,
        })?;
        self.backend.put(&key, &json)
    }

    pub fn load_queue(&self) -> Result<Vec<PendingAction>, StorageError> {
        let key = self.queue_key();
        match self.backend.get(&key)? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|source| StorageError::Corruption { key, source }),
            None => Ok(Vec::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Collection pages
    // -----------------------------------------------------------------------

    pub fn save_page(&self, key: &CollectionKey, page: &CollectionPage) -> Result<(), StorageError> {
        let storage_key = self.page_key(key);
        let doc = PersistedPage {
            key: key.clone(),
            page: page.clone(),
        };
        let json = serde_json::to_string(&doc).map_err(|source| StorageError::Serialize {
            key: storage_key.clone(),
            source,
        })?;
        self.backend.put(&storage_key, &json)
    }

    pub fn remove_page(&self, key: &CollectionKey) -> Result<(), StorageError> {
        self.backend.delete(&self.page_key(key))
    }

    /// Every persisted page of `domain`, ordered by storage key.
    pub fn load_pages(
        &self,
        domain: Domain,
    ) -> Result<Vec<(CollectionKey, CollectionPage)>, StorageError> {
        let prefix = self.domain_prefix(domain);
        let mut pages = Vec::new();
        for storage_key in self.backend.keys_with_prefix(&prefix)? {
            let Some(json) = self.backend.get(&storage_key)? else {
                continue;
            };
            let doc: PersistedPage = serde_json::from_str(&json).map_err(|source| {
                StorageError::Corruption {
                    key: storage_key.clone(),
                    source,
                }
            })?;
            pages.push((doc.key, doc.page));
        }
        Ok(pages)
    }

    fn queue_key(&self) -> String {
        format!("{}/queue", self.namespace)
    }

    fn domain_prefix(&self, domain: Domain) -> String {
        format!("{}/{}/collections/", self.namespace, domain)
    }

    fn page_key(&self, key: &CollectionKey) -> String {
        format!("{}{}", self.domain_prefix(key.domain), key)
    }
}
