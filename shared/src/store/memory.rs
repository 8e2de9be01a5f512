use std::sync::Mutex;

use async_trait::async_trait;

use super::{PersistentStore, StorageError, DEFAULT_DETAIL_LIMIT};
use crate::model::{Event, EventId, Timestamp};

#[derive(Debug, Default)]
struct MemoryInner {
    events: Vec<Event>,
    /// Oldest write first.
    details: Vec<Event>,
    sync_cursor: Option<Timestamp>,
    total_count: Option<usize>,
    loaded_pages: Option<usize>,
}

/// Process-local store. Nothing survives a restart; used in tests and as the
/// fallback when no durable store can be opened.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    detail_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            detail_limit: DEFAULT_DETAIL_LIMIT,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated as if a previous session had saved `events`.
    pub fn with_events(events: Vec<Event>, total_count: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                events,
                total_count,
                ..Default::default()
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_detail_limit(mut self, limit: usize) -> Self {
        self.detail_limit = limit;
        self
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> Result<T, StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockFailed)?;
        Ok(f(&mut inner))
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<Event>, StorageError> {
        self.with_inner(|inner| inner.events.clone())
    }

    async fn put_all(&self, events: &[Event]) -> Result<(), StorageError> {
        self.with_inner(|inner| inner.events = events.to_vec())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.with_inner(|inner| *inner = MemoryInner::default())
    }

    async fn get_sync_cursor(&self) -> Result<Option<Timestamp>, StorageError> {
        self.with_inner(|inner| inner.sync_cursor)
    }

    async fn set_sync_cursor(&self, cursor: Timestamp) -> Result<(), StorageError> {
        self.with_inner(|inner| inner.sync_cursor = Some(cursor))
    }

    async fn get_total_count(&self) -> Result<Option<usize>, StorageError> {
        self.with_inner(|inner| inner.total_count)
    }

    async fn set_total_count(&self, total: usize) -> Result<(), StorageError> {
        self.with_inner(|inner| inner.total_count = Some(total))
    }

    async fn get_loaded_pages(&self) -> Result<Option<usize>, StorageError> {
        self.with_inner(|inner| inner.loaded_pages)
    }

    async fn set_loaded_pages(&self, pages: usize) -> Result<(), StorageError> {
        self.with_inner(|inner| inner.loaded_pages = Some(pages))
    }

    async fn get_detail(&self, id: &EventId) -> Result<Option<Event>, StorageError> {
        self.with_inner(|inner| inner.details.iter().find(|e| &e.id == id).cloned())
    }

    async fn put_detail(&self, event: &Event) -> Result<(), StorageError> {
        let limit = self.detail_limit;
        self.with_inner(|inner| {
            inner.details.retain(|e| e.id != event.id);
            inner.details.push(event.clone());
            let excess = inner.details.len().saturating_sub(limit);
            inner.details.drain(..excess);
        })
    }
}
