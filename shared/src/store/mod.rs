//! Durable local storage for the event collection.
//!
//! The controller treats the store as a black-box key/blob store: no ordering
//! is assumed on read, and any call may fail. A failing store degrades the
//! controller to network-only operation, it never blocks it.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DEFAULT_MAX_DETAIL_RECORDS;
use crate::model::{Event, EventId, Timestamp};

mod file;
mod key;
mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::file::FileStore;
pub use self::key::{KeyNamespace, StoreKey};
pub use self::memory::MemoryStore;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

/// Detail records a store keeps unless told otherwise. Matches the controller's
/// default arena capacity.
pub const DEFAULT_DETAIL_LIMIT: usize = DEFAULT_MAX_DETAIL_RECORDS;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("lock acquisition failed")]
    LockFailed,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<ciborium::de::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[async_trait]
pub trait PersistentStore: Send + Sync + 'static {
    async fn get_all(&self) -> Result<Vec<Event>, StorageError>;

    /// Replaces the stored collection. Writing the same collection twice is a no-op.
    async fn put_all(&self, events: &[Event]) -> Result<(), StorageError>;

    /// Drops events, details and metadata.
    async fn clear(&self) -> Result<(), StorageError>;

    async fn get_sync_cursor(&self) -> Result<Option<Timestamp>, StorageError>;

    async fn set_sync_cursor(&self, cursor: Timestamp) -> Result<(), StorageError>;

    async fn get_total_count(&self) -> Result<Option<usize>, StorageError>;

    async fn set_total_count(&self, total: usize) -> Result<(), StorageError>;

    /// Server listing pages already merged into the stored collection.
    async fn get_loaded_pages(&self) -> Result<Option<usize>, StorageError>;

    async fn set_loaded_pages(&self, pages: usize) -> Result<(), StorageError>;

    async fn get_detail(&self, id: &EventId) -> Result<Option<Event>, StorageError>;

    /// Upserts a detail record. Past the store's detail limit the least
    /// recently written record is dropped.
    async fn put_detail(&self, event: &Event) -> Result<(), StorageError>;
}
