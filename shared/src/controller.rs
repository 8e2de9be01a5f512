//! Offline-first event cache.
//!
//! [`CacheController`] owns the full cache, the displayed window over it, the
//! sync cursor and a bounded arena of detail records. Commands never return
//! errors: failures are recorded on the published [`CacheSnapshot`] and the
//! cached data stays in place.
//!
//! Locks are never held across a store or remote call. Every command that
//! awaits I/O captures the controller generation first and drops its result
//! if a refresh or logout bumped the generation in the meantime.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{CacheConfig, ConfigError};
use crate::error::{CacheError, DisplayError, ErrorKind};
use crate::merge::{self, MergeStats};
use crate::model::{
    CacheSnapshot, CacheStatus, Event, EventFilters, EventId, MutationDelta, PendingMutation,
    Timestamp,
};
use crate::network::{Connectivity, ReconnectHandler};
use crate::pagination::{NextPage, Pagination};
use crate::remote::{RemoteEventSource, RemoteFetchError};
use crate::store::PersistentStore;

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    Loading,
    NoMore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Shown from memory or the local store; a background sync was started.
    FromCache { events: usize },
    FromNetwork { events: usize, persisted: bool },
    OfflineNoData,
    Failed(DisplayError),
    /// A refresh or logout happened while loading.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    /// The local cursor already covers the server timestamp.
    UpToDate,
    Applied {
        inserted: usize,
        replaced: usize,
        persisted: bool,
    },
    Failed(DisplayError),
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Skipped(SkipReason),
    /// Revealed entries that were already cached.
    FromCache { revealed: usize },
    FromNetwork { fetched: usize, persisted: bool },
    /// Nothing left to reveal and the network cannot provide more right now.
    Exhausted,
    Failed(DisplayError),
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied { mutation_id: Uuid, persisted: bool },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reloaded(LoadOutcome),
    Synced(SyncOutcome),
}

// ============================================================================
// State
// ============================================================================

struct CacheState {
    status: CacheStatus,
    full_cache: Vec<Event>,
    pagination: Pagination,
    details: LruCache<EventId, Event>,
    sync_cursor: Option<Timestamp>,
    is_loading: bool,
    is_syncing: bool,
    error: Option<DisplayError>,
    pending: Vec<PendingMutation>,
    active_filters: Option<EventFilters>,
    generation: u64,
}

impl CacheState {
    fn new(page_size: usize, detail_capacity: NonZeroUsize) -> Self {
        Self {
            status: CacheStatus::Empty,
            full_cache: Vec::new(),
            pagination: Pagination::new(page_size),
            details: LruCache::new(detail_capacity),
            sync_cursor: None,
            is_loading: false,
            is_syncing: false,
            error: None,
            pending: Vec::new(),
            active_filters: None,
            generation: 0,
        }
    }

    fn displayed_len(&self) -> usize {
        self.pagination.window_len(self.full_cache.len())
    }

    fn snapshot(&self) -> CacheSnapshot {
        let displayed = self.displayed_len();
        CacheSnapshot {
            status: self.status,
            displayed_events: self.full_cache[..displayed].to_vec(),
            is_loading: self.is_loading,
            is_syncing: self.is_syncing,
            has_more: self.pagination.has_more(displayed, self.full_cache.len()),
            error: self.error.clone(),
            categories: merge::distinct_categories(&self.full_cache),
            current_page: self.pagination.current_page,
            total_count: self.pagination.total_count,
            pending_mutations: self.pending.len(),
        }
    }

    /// Merges `incoming` into the full cache and refreshes any detail record
    /// held for the same ids.
    fn absorb(&mut self, incoming: Vec<Event>) -> MergeStats {
        for event in &incoming {
            if let Some(detail) = self.details.peek_mut(&event.id) {
                *detail = event.clone();
            }
        }
        let existing = std::mem::take(&mut self.full_cache);
        let (merged, stats) = merge::merge_owned(existing, incoming);
        self.full_cache = merged;
        stats
    }

    /// Server data for these ids supersedes any provisional change.
    fn retire_pending(&mut self, ids: &HashSet<EventId>) {
        let before = self.pending.len();
        self.pending.retain(|m| !ids.contains(&m.event_id));
        let retired = before - self.pending.len();
        if retired > 0 {
            debug!(retired, "retired pending mutations");
        }
    }

    fn reset(&mut self, page_size: usize, forget_cursor: bool) {
        self.generation = self.generation.wrapping_add(1);
        self.status = CacheStatus::Empty;
        self.full_cache.clear();
        self.details.clear();
        self.pending.clear();
        self.pagination = Pagination::new(page_size);
        self.is_loading = false;
        self.is_syncing = false;
        self.error = None;
        self.active_filters = None;
        if forget_cursor {
            self.sync_cursor = None;
        }
    }

    /// Reveals whatever partial page is cached, or marks the network as
    /// exhausted when nothing is left.
    fn reveal_or_exhaust(&mut self, available: usize) -> Option<usize> {
        if available > 0 {
            self.pagination.advance();
            Some(available)
        } else {
            self.pagination.network_exhausted = true;
            None
        }
    }
}

#[derive(Default)]
struct StoredCache {
    events: Vec<Event>,
    total_count: Option<usize>,
    loaded_pages: Option<usize>,
    sync_cursor: Option<Timestamp>,
}

// ============================================================================
// Controller
// ============================================================================

struct Inner<S, R> {
    store: Arc<S>,
    remote: Arc<R>,
    connectivity: Connectivity,
    config: CacheConfig,
    state: RwLock<CacheState>,
    snapshot_tx: watch::Sender<CacheSnapshot>,
    persist_lock: Mutex<()>,
    background: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the event cache. Clones share the same state.
///
/// Register it with a [`NetworkMonitor`](crate::network::NetworkMonitor)
/// through `spawn_reconnect_listener(controller.clone())`.
pub struct CacheController<S: PersistentStore, R: RemoteEventSource> {
    inner: Arc<Inner<S, R>>,
}

impl<S: PersistentStore, R: RemoteEventSource> Clone for CacheController<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PersistentStore, R: RemoteEventSource> CacheController<S, R> {
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        connectivity: Connectivity,
        config: CacheConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_detail_records)
            .ok_or_else(|| ConfigError::Invalid("max_detail_records must be > 0".into()))?;

        let state = CacheState::new(config.page_size, capacity);
        let (snapshot_tx, _) = watch::channel(state.snapshot());

        info!(page_size = config.page_size, "cache controller created");

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                connectivity,
                config,
                state: RwLock::new(state),
                snapshot_tx,
                persist_lock: Mutex::new(()),
                background: Mutex::new(None),
            }),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// The whole local collection, in canonical order.
    pub async fn cached_events(&self) -> Vec<Event> {
        self.inner.state.read().await.full_cache.clone()
    }

    pub async fn sync_cursor(&self) -> Option<Timestamp> {
        self.inner.state.read().await.sync_cursor
    }

    pub async fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.inner.state.read().await.pending.clone()
    }

    /// Detail record for `id`, without touching the network.
    pub async fn detail(&self, id: &EventId) -> Option<Event> {
        self.inner.state.read().await.details.peek(id).cloned()
    }

    /// Waits for the background sync started by the last cache-backed load.
    pub async fn settle(&self) {
        let task = self.inner.background.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "background sync task failed");
            }
        }
    }

    fn page_size(&self) -> usize {
        self.inner.config.page_size
    }

    fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    fn publish(&self, state: &CacheState) {
        debug_assert!(merge::is_canonical(&state.full_cache));
        self.inner.snapshot_tx.send_replace(state.snapshot());
    }

    async fn record_error(&self, generation: u64, error: &CacheError) {
        let mut state = self.inner.state.write().await;
        if state.generation != generation {
            return;
        }
        state.error = Some(DisplayError::from(error));
        self.publish(&state);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Shows the first page, from memory or the store when possible.
    ///
    /// Calling it with filters other than the ones the cache was built for
    /// goes through [`refresh`](Self::refresh).
    #[instrument(skip(self))]
    pub async fn load_initial(&self, filters: EventFilters) -> LoadOutcome {
        let filters = filters.normalized();
        let filters_changed = {
            let state = self.inner.state.read().await;
            !state.full_cache.is_empty()
                && state.active_filters.as_ref().is_some_and(|f| f != &filters)
        };
        if filters_changed {
            info!("filters changed, rebuilding cache");
            return self.refresh(filters).await;
        }
        self.load_initial_inner(filters).await
    }

    async fn load_initial_inner(&self, filters: EventFilters) -> LoadOutcome {
        let (generation, needs_store) = {
            let mut state = self.inner.state.write().await;
            state.pagination.reset();
            state.active_filters = Some(filters.clone());
            state.is_loading = true;
            if state.full_cache.is_empty() {
                state.status = CacheStatus::Loading;
            }
            self.publish(&state);
            (state.generation, state.full_cache.is_empty())
        };

        let stored = if needs_store {
            self.read_store().await
        } else {
            StoredCache::default()
        };

        {
            let mut state = self.inner.state.write().await;
            if state.generation != generation {
                return LoadOutcome::Superseded;
            }

            if !stored.events.is_empty() {
                state.absorb(stored.events);
                state.pagination.total_count = stored
                    .total_count
                    .unwrap_or(0)
                    .max(state.full_cache.len());
                // Without a recorded page cursor the listing is re-walked from
                // page 1; the merge absorbs the overlap.
                state
                    .pagination
                    .mark_loaded(stored.loaded_pages.unwrap_or(0));
                state.sync_cursor = state.sync_cursor.max(stored.sync_cursor);
            }

            if !state.full_cache.is_empty() {
                state.status = CacheStatus::Ready;
                state.is_loading = false;
                state.error = None;
                self.publish(&state);

                let events = state.full_cache.len();
                info!(events, "showing cached events");
                drop(state);

                self.spawn_background_sync(filters).await;
                return LoadOutcome::FromCache { events };
            }

            if !self.is_online() {
                warn!("offline with nothing cached");
                state.status = CacheStatus::Error;
                state.is_loading = false;
                state.error = Some(DisplayError::from(&CacheError::NetworkUnavailable));
                self.publish(&state);
                return LoadOutcome::OfflineNoData;
            }
        }

        self.load_first_page(generation, &filters).await
    }

    async fn spawn_background_sync(&self, filters: EventFilters) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let outcome = this.sync(filters).await;
            debug!(?outcome, "background sync finished");
        });
        *self.inner.background.lock().await = Some(task);
    }

    async fn read_store(&self) -> StoredCache {
        let store = &self.inner.store;

        let events = store.get_all().await.unwrap_or_else(|e| {
            warn!(error = %e, "cached events unreadable, continuing without them");
            Vec::new()
        });
        let total_count = store.get_total_count().await.unwrap_or_else(|e| {
            warn!(error = %e, "cached total count unreadable");
            None
        });
        let loaded_pages = store.get_loaded_pages().await.unwrap_or_else(|e| {
            warn!(error = %e, "page cursor unreadable");
            None
        });
        let sync_cursor = store.get_sync_cursor().await.unwrap_or_else(|e| {
            warn!(error = %e, "sync cursor unreadable");
            None
        });

        StoredCache {
            events,
            total_count,
            loaded_pages,
            sync_cursor,
        }
    }

    async fn load_first_page(&self, generation: u64, filters: &EventFilters) -> LoadOutcome {
        let remote = &self.inner.remote;

        // Taken before the page so anything changed in between is picked up
        // by the next sync.
        let server_ts = remote
            .fetch_latest_server_timestamp()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "server timestamp unavailable, cursor stays put");
                None
            });
        let result = remote.fetch_page(1, self.page_size(), filters, None).await;

        let events = {
            let mut state = self.inner.state.write().await;
            if state.generation != generation {
                return LoadOutcome::Superseded;
            }
            state.is_loading = false;

            match result {
                Err(e) => {
                    warn!(error = %e, "first page fetch failed");
                    let error = CacheError::from(e);
                    let display = DisplayError::from(&error);
                    state.status = CacheStatus::Error;
                    state.error = Some(display.clone());
                    self.publish(&state);
                    return LoadOutcome::Failed(display);
                }
                Ok(page) => {
                    state.absorb(page.events);
                    state.pagination.total_count = page.total_count;
                    state.pagination.mark_loaded(1);
                    state.status = CacheStatus::Ready;
                    state.error = None;
                    self.publish(&state);
                    state.full_cache.len()
                }
            }
        };

        info!(events, "first page loaded from network");
        let persisted = self.persist(generation).await;
        if persisted {
            self.commit_sync_point(generation, server_ts).await;
        }
        LoadOutcome::FromNetwork { events, persisted }
    }

    /// Reveals the next page, from the cache when it can.
    #[instrument(skip(self))]
    pub async fn load_more(&self, filters: EventFilters) -> PageOutcome {
        let filters = filters.normalized();

        let (generation, server_page) = {
            let mut state = self.inner.state.write().await;
            if state.is_syncing {
                return PageOutcome::Skipped(SkipReason::AlreadySyncing);
            }
            if state.is_loading {
                return PageOutcome::Skipped(SkipReason::Loading);
            }
            let displayed = state.displayed_len();
            if !state.pagination.has_more(displayed, state.full_cache.len()) {
                return PageOutcome::Skipped(SkipReason::NoMore);
            }

            match state.pagination.next_page(state.full_cache.len()) {
                NextPage::Cached => {
                    state.pagination.advance();
                    self.publish(&state);
                    debug!(page = state.pagination.current_page, "page served from cache");
                    return PageOutcome::FromCache {
                        revealed: self.page_size(),
                    };
                }
                NextPage::Network {
                    server_page,
                    available,
                } => {
                    if !self.is_online() {
                        let outcome = match state.reveal_or_exhaust(available) {
                            Some(revealed) => PageOutcome::FromCache { revealed },
                            None => {
                                warn!("offline at the end of the cache");
                                state.error =
                                    Some(DisplayError::from(&CacheError::NetworkUnavailable));
                                PageOutcome::Exhausted
                            }
                        };
                        self.publish(&state);
                        return outcome;
                    }
                    state.is_loading = true;
                    self.publish(&state);
                    (state.generation, server_page)
                }
            }
        };

        let mut server_page = server_page;
        let mut fetched = 0;
        loop {
            let result = self
                .inner
                .remote
                .fetch_page(server_page, self.page_size(), &filters, None)
                .await;

            let mut state = self.inner.state.write().await;
            if state.generation != generation {
                return PageOutcome::Superseded;
            }
            let available = state.pagination.cached_beyond_window(state.full_cache.len());

            let page = match result {
                Err(e) => {
                    warn!(error = %e, server_page, "page fetch failed");
                    state.is_loading = false;
                    let display = DisplayError::from(&CacheError::from(e));
                    let revealed = state.reveal_or_exhaust(available);
                    if revealed.is_none() {
                        state.error = Some(display.clone());
                    }
                    self.publish(&state);
                    if fetched > 0 {
                        break;
                    }
                    return match revealed {
                        Some(revealed) => PageOutcome::FromCache { revealed },
                        None => PageOutcome::Failed(display),
                    };
                }
                Ok(page) => page,
            };

            if page.events.is_empty() {
                info!(server_page, "server returned an empty page");
                state.is_loading = false;
                state.pagination.total_count = page.total_count;
                let revealed = state.reveal_or_exhaust(available);
                self.publish(&state);
                if fetched > 0 {
                    break;
                }
                return match revealed {
                    Some(revealed) => PageOutcome::FromCache { revealed },
                    None => PageOutcome::Exhausted,
                };
            }

            fetched += page.events.len();
            let stats = state.absorb(page.events);
            state.pagination.total_count = page.total_count;
            state.pagination.mark_loaded(server_page);
            state.error = None;
            debug!(
                server_page,
                inserted = stats.inserted,
                replaced = stats.replaced,
                "page merged"
            );

            // Rows merged earlier by sync or a push can make a whole server
            // page redundant; keep walking until the window can grow.
            if state.pagination.cached_beyond_window(state.full_cache.len()) > 0 {
                state.pagination.advance();
            } else if state.pagination.server_covered() {
                debug!("listing fully walked");
                state.pagination.network_exhausted = true;
            } else {
                self.publish(&state);
                server_page = state.pagination.loaded_pages + 1;
                continue;
            }
            state.is_loading = false;
            self.publish(&state);
            break;
        }

        let persisted = self.persist(generation).await;
        if persisted {
            self.save_listing_meta(generation).await;
        }
        PageOutcome::FromNetwork { fetched, persisted }
    }

    /// Pulls changes since the sync cursor and shows the top of the merged list.
    #[instrument(skip(self))]
    pub async fn sync(&self, filters: EventFilters) -> SyncOutcome {
        let filters = filters.normalized();

        let (generation, cursor, known_ids) = {
            let mut state = self.inner.state.write().await;
            if !self.is_online() {
                debug!("offline, sync skipped");
                return SyncOutcome::Skipped(SkipReason::Offline);
            }
            if state.is_syncing {
                debug!("sync already in flight");
                return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
            }
            state.is_syncing = true;
            self.publish(&state);
            let ids: Vec<EventId> = state.full_cache.iter().map(|e| e.id.clone()).collect();
            (state.generation, state.sync_cursor, ids)
        };

        let remote = &self.inner.remote;

        let server_ts = match remote.fetch_latest_server_timestamp().await {
            Ok(ts) => ts,
            Err(e) => return self.fail_sync(generation, e).await,
        };
        let Some(server_ts) = server_ts else {
            debug!("server reported no timestamp");
            self.finish_sync(generation).await;
            return SyncOutcome::UpToDate;
        };
        if cursor.is_some_and(|c| c >= server_ts) {
            debug!(%server_ts, "cache already current");
            self.finish_sync(generation).await;
            return SyncOutcome::UpToDate;
        }

        // No cursor means the cache came from somewhere that never synced.
        let since = cursor.unwrap_or_default();

        let delta = match remote
            .fetch_page(1, self.page_size(), &filters, Some(since))
            .await
        {
            Ok(page) => page,
            Err(e) => return self.fail_sync(generation, e).await,
        };
        let revalidated = if known_ids.is_empty() {
            Vec::new()
        } else {
            match remote.fetch_changed_since(&known_ids, since).await {
                Ok(events) => events,
                Err(e) => return self.fail_sync(generation, e).await,
            }
        };

        let stats = {
            let mut state = self.inner.state.write().await;
            if state.generation != generation {
                info!("discarding result of superseded sync");
                return SyncOutcome::Superseded;
            }

            let incoming: Vec<Event> = delta.events.into_iter().chain(revalidated).collect();
            let ids: HashSet<EventId> = incoming.iter().map(|e| e.id.clone()).collect();
            state.retire_pending(&ids);
            let stats = state.absorb(incoming);

            state.pagination.total_count = delta.total_count;
            state.pagination.reset();
            state.status = CacheStatus::Ready;
            state.error = None;
            self.publish(&state);
            stats
        };

        let persisted = self.persist(generation).await;
        if persisted {
            self.commit_sync_point(generation, Some(server_ts)).await;
        }
        self.finish_sync(generation).await;

        info!(
            inserted = stats.inserted,
            replaced = stats.replaced,
            persisted,
            "sync applied"
        );
        SyncOutcome::Applied {
            inserted: stats.inserted,
            replaced: stats.replaced,
            persisted,
        }
    }

    async fn fail_sync(&self, generation: u64, error: RemoteFetchError) -> SyncOutcome {
        warn!(error = %error, "sync failed, keeping cached events");
        let error = CacheError::from(error);
        let display = DisplayError::from(&error);

        let mut state = self.inner.state.write().await;
        if state.generation != generation {
            return SyncOutcome::Superseded;
        }
        state.is_syncing = false;
        state.error = Some(display.clone());
        self.publish(&state);
        SyncOutcome::Failed(display)
    }

    async fn finish_sync(&self, generation: u64) {
        let mut state = self.inner.state.write().await;
        if state.generation != generation {
            return;
        }
        state.is_syncing = false;
        self.publish(&state);
    }

    /// Discards everything cached and loads from scratch.
    #[instrument(skip(self))]
    pub async fn refresh(&self, filters: EventFilters) -> LoadOutcome {
        info!("forced refresh");
        self.reset(false).await;
        self.clear_store().await;
        self.load_initial_inner(filters.normalized()).await
    }

    /// Drops all cached data, including the sync cursor, for a signed-out user.
    #[instrument(skip(self))]
    pub async fn clear_for_logout(&self) {
        info!("clearing cache for logout");
        self.reset(true).await;
        self.clear_store().await;
    }

    async fn reset(&self, forget_cursor: bool) {
        let mut state = self.inner.state.write().await;
        state.reset(self.page_size(), forget_cursor);
        self.publish(&state);
    }

    async fn clear_store(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        if let Err(e) = self.inner.store.clear().await {
            warn!(error = %e, "clearing local store failed");
            let generation = self.inner.state.read().await.generation;
            self.record_error(generation, &CacheError::from(e)).await;
        }
    }

    /// One event, from the cache when present.
    ///
    /// `None` means the event does not exist, or could not be reached and was
    /// never cached.
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn fetch_by_id(&self, id: &EventId) -> Option<Event> {
        let generation = {
            let mut state = self.inner.state.write().await;
            if let Some(event) = state.full_cache.iter().find(|e| &e.id == id).cloned() {
                state.details.put(id.clone(), event.clone());
                return Some(event);
            }
            state.generation
        };

        if !self.is_online() {
            let cached = self.cached_detail(id).await;
            if cached.is_none() {
                self.record_error(generation, &CacheError::NetworkUnavailable)
                    .await;
            }
            return cached;
        }

        match self.inner.remote.fetch_by_id(id).await {
            Ok(Some(event)) => {
                {
                    let mut state = self.inner.state.write().await;
                    if state.generation == generation {
                        state.details.put(id.clone(), event.clone());
                    }
                }
                if let Err(e) = self.inner.store.put_detail(&event).await {
                    warn!(error = %e, "saving detail record failed");
                }
                Some(event)
            }
            Ok(None) => {
                debug!("event does not exist");
                self.inner.state.write().await.details.pop(id);
                None
            }
            Err(e) => {
                warn!(error = %e, "detail fetch failed, falling back to cache");
                self.record_error(generation, &CacheError::from(e)).await;
                self.cached_detail(id).await
            }
        }
    }

    async fn cached_detail(&self, id: &EventId) -> Option<Event> {
        if let Some(event) = self.inner.state.write().await.details.get(id) {
            return Some(event.clone());
        }

        match self.inner.store.get_detail(id).await {
            Ok(Some(event)) => {
                self.inner
                    .state
                    .write()
                    .await
                    .details
                    .put(id.clone(), event.clone());
                Some(event)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "detail record unreadable");
                None
            }
        }
    }

    /// Applies a provisional change to every view of the event at once.
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn apply_optimistic_mutation(
        &self,
        id: &EventId,
        delta: MutationDelta,
    ) -> MutationOutcome {
        let (generation, mutation_id, in_list, detail) = {
            let mut state = self.inner.state.write().await;

            let listed = state.full_cache.iter_mut().find(|e| &e.id == id).map(|event| {
                event.apply_delta(delta);
                event.clone()
            });
            let in_list = listed.is_some();

            let detail = match (listed, state.details.peek_mut(id)) {
                (Some(listed), Some(detail)) => {
                    *detail = listed;
                    Some(detail.clone())
                }
                (None, Some(detail)) => {
                    detail.apply_delta(delta);
                    Some(detail.clone())
                }
                (_, None) => None,
            };

            if !in_list && detail.is_none() {
                warn!("mutation for an event that is not cached");
                return MutationOutcome::NotFound;
            }

            let mutation = PendingMutation::new(id.clone(), delta);
            let mutation_id = mutation.mutation_id;
            state.pending.push(mutation);
            self.publish(&state);
            (state.generation, mutation_id, in_list, detail)
        };

        info!(%mutation_id, "optimistic mutation applied");

        let mut persisted = true;
        if in_list {
            persisted = self.persist(generation).await;
        }
        if let Some(detail) = detail {
            if let Err(e) = self.inner.store.put_detail(&detail).await {
                warn!(error = %e, "saving mutated detail record failed");
                self.record_error(generation, &CacheError::from(e)).await;
                persisted = false;
            }
        }

        MutationOutcome::Applied {
            mutation_id,
            persisted,
        }
    }

    /// Merges one pushed event in place; the visible page count stays as is.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn apply_realtime_update(&self, event: Event) {
        let generation = {
            let mut state = self.inner.state.write().await;
            state.retire_pending(&HashSet::from([event.id.clone()]));
            let stats = state.absorb(vec![event]);
            state.pagination.total_count += stats.inserted;
            if matches!(state.status, CacheStatus::Empty | CacheStatus::Error) {
                state.status = CacheStatus::Ready;
            }
            self.publish(&state);
            state.generation
        };
        self.persist(generation).await;
    }

    /// Re-arms pagination and catches up with the server after connectivity returns.
    #[instrument(skip(self))]
    pub async fn handle_reconnect(&self) -> ReconnectOutcome {
        let (empty, filters) = {
            let mut state = self.inner.state.write().await;
            state.pagination.network_exhausted = false;
            if state
                .error
                .as_ref()
                .is_some_and(|e| e.kind == ErrorKind::NetworkUnavailable)
            {
                state.error = None;
            }
            self.publish(&state);
            (
                state.full_cache.is_empty(),
                state.active_filters.clone().unwrap_or_default(),
            )
        };

        if empty {
            info!("reconnected with an empty cache, loading");
            ReconnectOutcome::Reloaded(self.load_initial_inner(filters).await)
        } else {
            info!("reconnected, syncing");
            ReconnectOutcome::Synced(self.sync(filters).await)
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Writes the current full cache. Writes are serialized and each one takes
    /// the state as of when it acquires the lock.
    async fn persist(&self, generation: u64) -> bool {
        let _guard = self.inner.persist_lock.lock().await;
        let events = {
            let state = self.inner.state.read().await;
            if state.generation != generation {
                return false;
            }
            state.full_cache.clone()
        };

        match self.inner.store.put_all(&events).await {
            Ok(()) => {
                debug!(events = events.len(), "cache persisted");
                true
            }
            Err(e) => {
                warn!(error = %e, "persisting cache failed");
                self.record_error(generation, &CacheError::from(e)).await;
                false
            }
        }
    }

    /// Advances the cursor (never backwards) and stores it with the listing
    /// metadata.
    async fn commit_sync_point(&self, generation: u64, server_ts: Option<Timestamp>) {
        let cursor = {
            let mut state = self.inner.state.write().await;
            if state.generation != generation {
                return;
            }
            state.sync_cursor = state.sync_cursor.max(server_ts);
            state.sync_cursor
        };

        if let Some(cursor) = cursor {
            if let Err(e) = self.inner.store.set_sync_cursor(cursor).await {
                warn!(error = %e, "saving sync cursor failed");
            }
        }
        self.save_listing_meta(generation).await;
    }

    async fn save_listing_meta(&self, generation: u64) {
        let (total_count, loaded_pages) = {
            let state = self.inner.state.read().await;
            if state.generation != generation {
                return;
            }
            (state.pagination.total_count, state.pagination.loaded_pages)
        };

        let store = &self.inner.store;
        if let Err(e) = store.set_total_count(total_count).await {
            warn!(error = %e, "saving total count failed");
        }
        if let Err(e) = store.set_loaded_pages(loaded_pages).await {
            warn!(error = %e, "saving page cursor failed");
        }
    }
}

#[async_trait]
impl<S: PersistentStore, R: RemoteEventSource> ReconnectHandler for CacheController<S, R> {
    async fn on_reconnect(&self) {
        let outcome = self.handle_reconnect().await;
        debug!(?outcome, "reconnect handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use crate::store::MemoryStore;
    use crate::testing::{base_time, sample_event, sample_events, FailingStore, ScriptedRemote};
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    type Controller = CacheController<FailingStore<MemoryStore>, ScriptedRemote>;

    struct Harness {
        controller: Controller,
        store: Arc<FailingStore<MemoryStore>>,
        remote: Arc<ScriptedRemote>,
        monitor: NetworkMonitor,
    }

    fn harness(stored: Vec<Event>, server: Vec<Event>, online: bool, page_size: usize) -> Harness {
        let stored_total = (!stored.is_empty()).then_some(stored.len());
        let store = Arc::new(FailingStore::new(MemoryStore::with_events(
            stored,
            stored_total,
        )));
        let remote = Arc::new(ScriptedRemote::new(server));
        let monitor = NetworkMonitor::new(online);
        let controller = CacheController::new(
            store.clone(),
            remote.clone(),
            monitor.handle(),
            CacheConfig::with_page_size(page_size),
        )
        .unwrap();
        Harness {
            controller,
            store,
            remote,
            monitor,
        }
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let monitor = NetworkMonitor::default();
        let result = CacheController::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedRemote::default()),
            monitor.handle(),
            CacheConfig::with_page_size(0),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn store_failure_on_cold_start_falls_back_to_network() {
        let h = harness(sample_events(4), sample_events(3), true, 2);
        h.store.set_fail_reads(true);

        let outcome = h.controller.load_initial(EventFilters::default()).await;

        assert!(matches!(outcome, LoadOutcome::FromNetwork { events: 2, .. }));
        assert_eq!(h.controller.snapshot().total_count, 3);
    }

    #[tokio::test]
    async fn failed_first_page_surfaces_error_state() {
        let h = harness(vec![], sample_events(3), true, 2);
        h.remote.set_failing(true);

        let outcome = h.controller.load_initial(EventFilters::default()).await;

        let LoadOutcome::Failed(error) = outcome else {
            panic!("expected a failed load");
        };
        assert_eq!(error.kind, ErrorKind::RemoteFetch);
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, CacheStatus::Error);
        assert!(!snapshot.is_loading);
    }

    #[tokio::test]
    async fn failed_sync_keeps_displayed_events() {
        let h = harness(sample_events(4), sample_events(4), true, 2);
        h.remote.set_server_timestamp(Some(base_time()));
        h.remote.set_failing(true);

        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;

        let snapshot = h.controller.snapshot();
        assert_eq!(ids(&snapshot.displayed_events), vec!["e1", "e2"]);
        assert_eq!(snapshot.error.map(|e| e.kind), Some(ErrorKind::RemoteFetch));
        assert!(!snapshot.is_syncing);
        assert_eq!(snapshot.status, CacheStatus::Ready);
    }

    #[tokio::test]
    async fn load_more_fetches_next_server_page() {
        let h = harness(vec![], sample_events(5), true, 2);
        h.controller.load_initial(EventFilters::default()).await;

        let outcome = h.controller.load_more(EventFilters::default()).await;

        assert_eq!(
            outcome,
            PageOutcome::FromNetwork {
                fetched: 2,
                persisted: true
            }
        );
        let snapshot = h.controller.snapshot();
        assert_eq!(ids(&snapshot.displayed_events), vec!["e1", "e2", "e3", "e4"]);
        assert!(snapshot.has_more);
        assert_eq!(h.store.inner().get_all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn load_more_stops_at_total_count() {
        let h = harness(vec![], sample_events(3), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.load_more(EventFilters::default()).await;

        let outcome = h.controller.load_more(EventFilters::default()).await;

        assert_eq!(outcome, PageOutcome::Skipped(SkipReason::NoMore));
        assert!(!h.controller.snapshot().has_more);
    }

    #[tokio::test]
    async fn failed_page_fetch_marks_network_exhausted() {
        let h = harness(vec![], sample_events(5), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.remote.set_failing(true);

        let outcome = h.controller.load_more(EventFilters::default()).await;

        assert!(matches!(outcome, PageOutcome::Failed(_)));
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.displayed_events.len(), 2);
        assert!(!snapshot.has_more);
    }

    #[tokio::test]
    async fn load_more_is_skipped_while_syncing() {
        let h = harness(sample_events(6), sample_events(6), true, 2);
        h.remote.set_server_timestamp(Some(base_time() + Duration::days(1)));
        let gate = h.remote.hold_changed_since();

        h.controller.load_initial(EventFilters::default()).await;
        while h.remote.calls.changed_since.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let outcome = h.controller.load_more(EventFilters::default()).await;
        assert_eq!(outcome, PageOutcome::Skipped(SkipReason::AlreadySyncing));

        let second = h.controller.sync(EventFilters::default()).await;
        assert_eq!(second, SyncOutcome::Skipped(SkipReason::AlreadySyncing));

        gate.add_permits(1);
        h.controller.settle().await;
        assert!(!h.controller.snapshot().is_syncing);
    }

    #[tokio::test]
    async fn sync_resets_to_first_page() {
        let h = harness(sample_events(6), sample_events(6), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;
        h.controller.load_more(EventFilters::default()).await;
        assert_eq!(h.controller.snapshot().current_page, 2);

        let mut changed = sample_event("e9", 100);
        changed.updated_at = Some(base_time() + Duration::hours(1));
        h.remote.upsert(changed);
        h.remote.set_server_timestamp(Some(base_time() + Duration::hours(2)));

        let outcome = h.controller.sync(EventFilters::default()).await;

        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                inserted: 1,
                replaced: 0,
                persisted: true
            }
        );
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.current_page, 1);
        assert_eq!(ids(&snapshot.displayed_events), vec!["e9", "e1"]);
        assert_eq!(snapshot.total_count, 7);
    }

    #[tokio::test]
    async fn cursor_does_not_advance_when_persist_fails() {
        let h = harness(sample_events(2), sample_events(2), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;

        let mut changed = sample_event("e1", 2);
        changed.updated_at = Some(base_time() + Duration::hours(1));
        h.remote.upsert(changed);
        h.remote.set_server_timestamp(Some(base_time() + Duration::hours(2)));
        h.store.set_fail_writes(true);

        let outcome = h.controller.sync(EventFilters::default()).await;

        assert!(matches!(outcome, SyncOutcome::Applied { persisted: false, .. }));
        assert_eq!(h.controller.sync_cursor().await, None);
        assert_eq!(
            h.controller.snapshot().error.map(|e| e.kind),
            Some(ErrorKind::Storage)
        );
    }

    #[tokio::test]
    async fn fetch_by_id_prefers_cache() {
        let h = harness(sample_events(3), sample_events(3), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;

        let event = h.controller.fetch_by_id(&EventId::new("e3")).await;

        assert_eq!(event.map(|e| e.id), Some(EventId::new("e3")));
        assert_eq!(h.remote.calls.fetch_by_id.load(Ordering::SeqCst), 0);
        assert!(h.controller.detail(&EventId::new("e3")).await.is_some());
    }

    #[tokio::test]
    async fn fetch_by_id_stores_detail_outside_the_list() {
        let mut server = sample_events(3);
        server.push(sample_event("far", 0));
        let h = harness(sample_events(3), server, true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;

        let event = h.controller.fetch_by_id(&EventId::new("far")).await;

        assert!(event.is_some());
        assert_eq!(h.controller.cached_events().await.len(), 3);
        assert!(h
            .store
            .inner()
            .get_detail(&EventId::new("far"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn fetch_by_id_not_found_is_not_an_error() {
        let h = harness(vec![], sample_events(1), true, 2);

        let event = h.controller.fetch_by_id(&EventId::new("ghost")).await;

        assert!(event.is_none());
        assert!(h.controller.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn fetch_by_id_offline_uses_stored_detail() {
        let h = harness(vec![], vec![], false, 2);
        h.store.inner().put_detail(&sample_event("d1", 1)).await.unwrap();

        let event = h.controller.fetch_by_id(&EventId::new("d1")).await;

        assert!(event.is_some());
        assert_eq!(h.remote.calls.total(), 0);
        assert!(h.controller.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn mutation_on_unknown_event_is_reported() {
        let h = harness(vec![], vec![], true, 2);

        let outcome = h
            .controller
            .apply_optimistic_mutation(&EventId::new("nope"), MutationDelta::ticket_purchase(1))
            .await;

        assert_eq!(outcome, MutationOutcome::NotFound);
        assert_eq!(h.controller.snapshot().pending_mutations, 0);
    }

    #[tokio::test]
    async fn realtime_update_retires_pending_and_keeps_page() {
        let h = harness(sample_events(6), sample_events(6), false, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.load_more(EventFilters::default()).await;
        h.controller
            .apply_optimistic_mutation(&EventId::new("e2"), MutationDelta::ticket_purchase(1))
            .await;
        assert_eq!(h.controller.snapshot().pending_mutations, 1);

        let mut pushed = sample_event("e2", 5);
        pushed.available_slot = 3;
        h.controller.apply_realtime_update(pushed).await;

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.pending_mutations, 0);
        assert_eq!(snapshot.current_page, 2);
        assert_eq!(snapshot.displayed_events[1].available_slot, 3);
    }

    #[tokio::test]
    async fn realtime_insert_extends_total() {
        let h = harness(sample_events(2), vec![], false, 2);
        h.controller.load_initial(EventFilters::default()).await;

        h.controller.apply_realtime_update(sample_event("new", 50)).await;

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.total_count, 3);
        assert_eq!(ids(&snapshot.displayed_events), vec!["new", "e1"]);
        assert!(snapshot.has_more);
    }

    #[tokio::test]
    async fn realtime_update_on_empty_cache_is_ready() {
        let h = harness(vec![], vec![], false, 2);
        h.controller.load_initial(EventFilters::default()).await;
        assert_eq!(h.controller.snapshot().status, CacheStatus::Error);

        h.controller.apply_realtime_update(sample_event("live", 3)).await;

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, CacheStatus::Ready);
        assert_eq!(ids(&snapshot.displayed_events), vec!["live"]);
    }

    #[tokio::test]
    async fn undecodable_page_surfaces_validation_error() {
        let h = harness(vec![], sample_events(5), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.remote.fail_with(Some(RemoteFetchError::Decode {
            reason: "all 2 rows in the batch were rejected".into(),
        }));

        let outcome = h.controller.load_more(EventFilters::default()).await;

        let PageOutcome::Failed(error) = outcome else {
            panic!("expected a failed page");
        };
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(h.controller.snapshot().displayed_events.len(), 2);
    }

    #[tokio::test]
    async fn load_more_saves_page_cursor() {
        let h = harness(vec![], sample_events(6), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        assert_eq!(h.store.inner().get_loaded_pages().await.unwrap(), Some(1));

        h.controller.load_more(EventFilters::default()).await;

        assert_eq!(h.store.inner().get_loaded_pages().await.unwrap(), Some(2));
        assert_eq!(h.store.inner().get_total_count().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn cold_start_resumes_from_stored_page_cursor() {
        let h = harness(sample_events(4), sample_events(6), true, 2);
        h.store.inner().set_total_count(6).await.unwrap();
        h.store.inner().set_loaded_pages(2).await.unwrap();
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;

        assert_eq!(
            h.controller.load_more(EventFilters::default()).await,
            PageOutcome::FromCache { revealed: 2 }
        );
        let outcome = h.controller.load_more(EventFilters::default()).await;

        assert_eq!(
            outcome,
            PageOutcome::FromNetwork {
                fetched: 2,
                persisted: true
            }
        );
        assert_eq!(h.remote.calls.fetch_page.load(Ordering::SeqCst), 1);
        assert_eq!(
            ids(&h.controller.snapshot().displayed_events),
            vec!["e1", "e2", "e3", "e4", "e5", "e6"]
        );
    }

    #[tokio::test]
    async fn load_more_walks_past_pages_already_merged() {
        let h = harness(vec![], sample_events(4), true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        // both land on server page 2, right after e2
        for id in ["p1", "p2"] {
            let pushed = sample_event(id, 3);
            h.remote.upsert(pushed.clone());
            h.controller.apply_realtime_update(pushed).await;
        }
        assert_eq!(
            h.controller.load_more(EventFilters::default()).await,
            PageOutcome::FromCache { revealed: 2 }
        );
        let before = h.controller.snapshot().current_page;

        let outcome = h.controller.load_more(EventFilters::default()).await;

        assert_eq!(
            outcome,
            PageOutcome::FromNetwork {
                fetched: 4,
                persisted: true
            }
        );
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.current_page, before + 1);
        assert_eq!(
            ids(&snapshot.displayed_events),
            vec!["e1", "e2", "p1", "p2", "e3", "e4"]
        );
        assert_eq!(snapshot.total_count, 6);
        assert!(!snapshot.has_more);
    }

    #[tokio::test]
    async fn filter_change_rebuilds_from_network() {
        let mut server = sample_events(4);
        server[3].category = "music".into();
        let h = harness(sample_events(4), server, true, 2);
        h.controller.load_initial(EventFilters::default()).await;
        h.controller.settle().await;

        let outcome = h
            .controller
            .load_initial(EventFilters::new(None, Some("Music")))
            .await;

        assert!(matches!(outcome, LoadOutcome::FromNetwork { events: 1, .. }));
        let snapshot = h.controller.snapshot();
        assert_eq!(ids(&snapshot.displayed_events), vec!["e4"]);
        assert_eq!(snapshot.categories, vec!["music"]);
    }

    #[tokio::test]
    async fn logout_forgets_everything() {
        let h = harness(vec![], sample_events(3), true, 2);
        h.remote.set_server_timestamp(Some(base_time()));
        h.controller.load_initial(EventFilters::default()).await;
        assert!(h.controller.sync_cursor().await.is_some());

        h.controller.clear_for_logout().await;

        assert_eq!(h.controller.sync_cursor().await, None);
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, CacheStatus::Empty);
        assert!(snapshot.displayed_events.is_empty());
        assert_eq!(snapshot.total_count, 0);
        assert!(h.store.inner().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_with_empty_cache_loads() {
        let h = harness(vec![], sample_events(3), false, 2);
        assert_eq!(
            h.controller.load_initial(EventFilters::default()).await,
            LoadOutcome::OfflineNoData
        );
        assert_eq!(h.controller.snapshot().status, CacheStatus::Error);

        h.monitor.set_online(true);
        let outcome = h.controller.handle_reconnect().await;

        assert!(matches!(
            outcome,
            ReconnectOutcome::Reloaded(LoadOutcome::FromNetwork { events: 2, .. })
        ));
        assert!(h.controller.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn subscribers_see_published_snapshots() {
        let h = harness(vec![], sample_events(3), true, 2);
        let mut rx = h.controller.subscribe();

        h.controller.load_initial(EventFilters::default()).await;

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.displayed_events.len(), 2);
        assert_eq!(snapshot.status, CacheStatus::Ready);
    }
}
