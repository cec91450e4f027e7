pub mod error;
pub mod types;

pub mod applier;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod pagination;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod state;
pub mod storage;

pub use applier::{MutationIntent, MutationOutcome};
pub use config::EngineConfig;
pub use engine::{EngineEvent, SyncEngine, SyncEngineOptions};
pub use error::{Result, SyncError};
