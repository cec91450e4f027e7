//! Persistence for engine state that must survive a restart.
//!
//! - [`traits`] — [`StorageBackend`], the raw key/value seam.
//! - [`memory`] — [`MemoryBackend`].
//! - [`sqlite`] — [`SqliteBackend`] (feature `sqlite`).
//! - [`persisted`] — [`PersistedState`], the queue and page codec.

pub mod memory;
pub mod persisted;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use memory::MemoryBackend;
pub use persisted::PersistedState;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use traits::StorageBackend;
