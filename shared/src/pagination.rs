//! Page bookkeeping for the displayed window.
//!
//! The window is always the first `window_len` entries of the full cache, so
//! it is tracked as a length rather than as a second collection.
//!
//! The full cache is not a prefix of the server listing: sync deltas and
//! realtime pushes land rows from anywhere in the server order. Which server
//! page to ask for next is therefore tracked separately, as `loaded_pages`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: usize,
    pub page_size: usize,
    /// Best known number of rows on the server for the active filters.
    pub total_count: usize,
    /// Server listing pages fetched so far, contiguous from page 1. Only a
    /// reset of the whole cache rewinds it.
    pub loaded_pages: usize,
    /// Set when a network page could not be had (offline, failure, or an
    /// empty page short of `total_count`). Cleared on reconnect or reset.
    pub network_exhausted: bool,
}

/// Where the next page comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPage {
    /// A full page is already cached beyond the window.
    Cached,
    /// Only `available` entries remain cached; the network should be asked
    /// for server page `server_page`.
    Network { server_page: usize, available: usize },
}

impl Pagination {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            current_page: 1,
            page_size: page_size.max(1),
            total_count: 0,
            loaded_pages: 0,
            network_exhausted: false,
        }
    }

    /// Back to the first page of the window. The server page cursor is kept.
    pub fn reset(&mut self) {
        self.current_page = 1;
        self.network_exhausted = false;
    }

    #[must_use]
    pub fn window_len(&self, full_len: usize) -> usize {
        self.current_page
            .saturating_mul(self.page_size)
            .min(full_len)
    }

    /// Bounded by `total_count`. Network exhaustion only hides more when no
    /// cached rows are left past the window.
    #[must_use]
    pub fn has_more(&self, displayed_len: usize, full_len: usize) -> bool {
        displayed_len < self.total_count && (displayed_len < full_len || !self.network_exhausted)
    }

    /// Cached entries not yet revealed.
    #[must_use]
    pub fn cached_beyond_window(&self, full_len: usize) -> usize {
        full_len - self.window_len(full_len)
    }

    #[must_use]
    pub fn next_page(&self, full_len: usize) -> NextPage {
        let available = self.cached_beyond_window(full_len);
        if available >= self.page_size {
            NextPage::Cached
        } else {
            NextPage::Network {
                server_page: self.loaded_pages.saturating_add(1),
                available,
            }
        }
    }

    /// Records that server page `page` was fetched.
    pub fn mark_loaded(&mut self, page: usize) {
        self.loaded_pages = self.loaded_pages.max(page);
    }

    /// Every server row has been asked for at least once.
    #[must_use]
    pub fn server_covered(&self) -> bool {
        self.loaded_pages.saturating_mul(self.page_size) >= self.total_count
    }

    pub fn advance(&mut self) {
        self.current_page = self.current_page.saturating_add(1);
    }
}
