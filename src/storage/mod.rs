//! Persistence drivers.
//!
//! - Event backends: JSONL files, SQLite, in-memory
//! - ConfigStore: versioned tenant configurations on disk

pub mod config_store;
pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use config_store::{ConfigStore, ConfigStoreError, StoredConfiguration};
pub use jsonl::JsonlBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
