//! In-memory collaborators for tests and UI previews.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use tokio::sync::Semaphore;

use crate::merge;
use crate::model::{Event, EventFilters, EventId, Timestamp};
use crate::remote::{EventPage, RemoteEventSource, RemoteFetchError};
use crate::store::{PersistentStore, StorageError};

/// 2026-01-01T00:00:00Z
pub fn base_time() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// An event starting `hour` hours after [`base_time`]; higher hours sort first.
pub fn sample_event(id: &str, hour: u32) -> Event {
    Event {
        id: EventId::new(id),
        title: format!("Event {id}"),
        description: None,
        location: None,
        start_time: base_time() + Duration::hours(i64::from(hour)),
        category: "general".into(),
        attendees: 0,
        available_slot: 10,
        is_approved: true,
        is_closed: false,
        updated_at: None,
    }
}

/// `count` events, ids `e1..=eN`, already in canonical order.
pub fn sample_events(count: u32) -> Vec<Event> {
    let events: Vec<Event> = (1..=count)
        .map(|i| sample_event(&format!("e{i}"), count - i + 1))
        .collect();
    merge::merge(&[], &events)
}

#[derive(Debug, Default)]
pub struct CallCounts {
    pub fetch_page: AtomicUsize,
    pub fetch_by_id: AtomicUsize,
    pub latest_timestamp: AtomicUsize,
    pub changed_since: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.fetch_page.load(Ordering::SeqCst)
            + self.fetch_by_id.load(Ordering::SeqCst)
            + self.latest_timestamp.load(Ordering::SeqCst)
            + self.changed_since.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ServerState {
    events: Vec<Event>,
    server_timestamp: Option<Timestamp>,
}

/// A remote backed by a vector of events.
///
/// Listing honours filters and paging; delta queries use `updated_at`.
/// Calls can be failed wholesale or held at `fetch_changed_since` until the
/// test releases them.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    state: Mutex<ServerState>,
    failure: Mutex<Option<RemoteFetchError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub calls: CallCounts,
}

impl ScriptedRemote {
    pub fn new(events: Vec<Event>) -> Self {
        let remote = Self::default();
        remote.with_state(|s| s.events = events);
        remote
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ServerState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    pub fn set_server_timestamp(&self, ts: Option<Timestamp>) {
        self.with_state(|s| s.server_timestamp = ts);
    }

    /// Inserts or replaces an event on the server.
    pub fn upsert(&self, event: Event) {
        self.with_state(|s| {
            s.events.retain(|e| e.id != event.id);
            s.events.push(event);
        });
    }

    pub fn remove(&self, id: &EventId) {
        self.with_state(|s| s.events.retain(|e| &e.id != id));
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_with(failing.then(|| RemoteFetchError::transport("injected failure")));
    }

    /// Every call fails with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<RemoteFetchError>) {
        *self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = error;
    }

    /// Holds every later `fetch_changed_since` call until permits are added
    /// to the returned semaphore.
    pub fn hold_changed_since(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self
            .gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(gate.clone());
        gate
    }

    fn check_failing(&self) -> Result<(), RemoteFetchError> {
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn matching(&self, filters: &EventFilters) -> Vec<Event> {
        let events = self.with_state(|s| s.events.clone());
        let filtered: Vec<Event> = events.into_iter().filter(|e| e.matches(filters)).collect();
        merge::merge(&[], &filtered)
    }
}

fn changed_after(event: &Event, since: Timestamp) -> bool {
    event.updated_at.is_some_and(|t| t > since)
}

#[async_trait]
impl RemoteEventSource for ScriptedRemote {
    async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
        filters: &EventFilters,
        since: Option<Timestamp>,
    ) -> Result<EventPage, RemoteFetchError> {
        self.calls.fetch_page.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;

        let matching = self.matching(filters);
        let total_count = matching.len();

        let events = match since {
            Some(since) => matching
                .into_iter()
                .filter(|e| changed_after(e, since))
                .collect(),
            None => matching
                .into_iter()
                .skip(page.saturating_sub(1) * page_size)
                .take(page_size)
                .collect(),
        };

        Ok(EventPage {
            events,
            total_count,
        })
    }

    async fn fetch_by_id(&self, id: &EventId) -> Result<Option<Event>, RemoteFetchError> {
        self.calls.fetch_by_id.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.with_state(|s| s.events.iter().find(|e| &e.id == id).cloned()))
    }

    async fn fetch_latest_server_timestamp(&self) -> Result<Option<Timestamp>, RemoteFetchError> {
        self.calls.latest_timestamp.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.with_state(|s| s.server_timestamp))
    }

    async fn fetch_changed_since(
        &self,
        ids: &[EventId],
        since: Timestamp,
    ) -> Result<Vec<Event>, RemoteFetchError> {
        self.calls.changed_since.fetch_add(1, Ordering::SeqCst);

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| RemoteFetchError::transport("gate closed"))?;
            permit.forget();
        }

        self.check_failing()?;
        let wanted: HashSet<&EventId> = ids.iter().collect();
        Ok(self.with_state(|s| {
            s.events
                .iter()
                .filter(|e| wanted.contains(&e.id) && changed_after(e, since))
                .cloned()
                .collect()
        }))
    }
}

/// Wraps a store and fails calls on demand.
#[derive(Debug, Default)]
pub struct FailingStore<S> {
    inner: S,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    pub put_all_calls: AtomicUsize,
}

impl<S: PersistentStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            put_all_calls: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: PersistentStore> PersistentStore for FailingStore<S> {
    async fn get_all(&self) -> Result<Vec<Event>, StorageError> {
        self.check(&self.fail_reads)?;
        self.inner.get_all().await
    }

    async fn put_all(&self, events: &[Event]) -> Result<(), StorageError> {
        self.put_all_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&self.fail_writes)?;
        self.inner.put_all(events).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check(&self.fail_writes)?;
        self.inner.clear().await
    }

    async fn get_sync_cursor(&self) -> Result<Option<Timestamp>, StorageError> {
        self.check(&self.fail_reads)?;
        self.inner.get_sync_cursor().await
    }

    async fn set_sync_cursor(&self, cursor: Timestamp) -> Result<(), StorageError> {
        self.check(&self.fail_writes)?;
        self.inner.set_sync_cursor(cursor).await
    }

    async fn get_total_count(&self) -> Result<Option<usize>, StorageError> {
        self.check(&self.fail_reads)?;
        self.inner.get_total_count().await
    }

    async fn set_total_count(&self, total: usize) -> Result<(), StorageError> {
        self.check(&self.fail_writes)?;
        self.inner.set_total_count(total).await
    }

    async fn get_loaded_pages(&self) -> Result<Option<usize>, StorageError> {
        self.check(&self.fail_reads)?;
        self.inner.get_loaded_pages().await
    }

    async fn set_loaded_pages(&self, pages: usize) -> Result<(), StorageError> {
        self.check(&self.fail_writes)?;
        self.inner.set_loaded_pages(pages).await
    }

    async fn get_detail(&self, id: &EventId) -> Result<Option<Event>, StorageError> {
        self.check(&self.fail_reads)?;
        self.inner.get_detail(id).await
    }

    async fn put_detail(&self, event: &Event) -> Result<(), StorageError> {
        self.check(&self.fail_writes)?;
        self.inner.put_detail(event).await
    }
}
