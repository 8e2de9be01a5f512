// lib.rs - offline-first event cache and sync engine

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod controller;
pub mod error;
pub mod merge;
pub mod model;
pub mod network;
pub mod pagination;
pub mod remote;
pub mod schema;
pub mod store;
pub mod testing;

pub use config::{CacheConfig, ConfigError};
pub use controller::{
    CacheController, LoadOutcome, MutationOutcome, PageOutcome, ReconnectOutcome, SkipReason,
    SyncOutcome,
};
pub use error::{CacheError, DisplayError, ErrorKind};
pub use model::{
    CacheSnapshot, CacheStatus, Event, EventFilters, EventId, MutationDelta, PendingMutation,
    Timestamp,
};
pub use network::{Connectivity, NetworkMonitor, ReconnectHandler};
pub use remote::{EventPage, RemoteEventSource, RemoteFetchError};
pub use schema::ValidationError;
pub use store::{FileStore, MemoryStore, PersistentStore, StorageError};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
