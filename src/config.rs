//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document (or none at all) is
//! a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items requested per page fetch. A shorter page marks the end.
    pub page_size: usize,
    /// How long a fetched page is trusted without a network round-trip.
    pub staleness_window_ms: u64,
    /// Maximum entries kept in memory per collection after realtime inserts.
    pub realtime_window: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// A change-feed connect that takes longer counts as a failed attempt.
    pub connect_timeout_ms: u64,
    /// Remote mutation calls exceeding this are treated as transient failures.
    pub mutation_timeout_ms: u64,
    /// Failed dispatches after which a queued action is discarded.
    pub queue_max_attempts: u32,
    /// Age after which a queued action is discarded.
    pub queue_max_age_ms: u64,
    pub merge_channel_capacity: usize,
    /// Prefix for every persisted key.
    pub storage_namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            staleness_window_ms: 5 * 60 * 1000,
            realtime_window: 100,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            connect_timeout_ms: 10_000,
            mutation_timeout_ms: 15_000,
            queue_max_attempts: 5,
            queue_max_age_ms: 24 * 60 * 60 * 1000,
            merge_channel_capacity: 256,
            storage_namespace: "confession-sync".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.staleness_window_ms as i64)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    pub fn queue_max_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.queue_max_age_ms as i64)
    }
}
