//! Contract for the backend that owns the event catalog.
//!
//! Implementations live in the shell (they wrap whatever HTTP client or
//! backend SDK the platform uses). Everything crossing this boundary is a
//! validated [`Event`]; raw rows go through [`crate::schema`] first.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Event, EventFilters, EventId, Timestamp};
use crate::schema::{self, RemoteEventRecord, ValidationError};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFetchError {
    #[error("connection failed: {message}")]
    Transport { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("undecodable response: {reason}")]
    Decode { reason: String },
}

impl RemoteFetchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteFetchError::Transport { .. } | RemoteFetchError::Timeout { .. } => true,
            RemoteFetchError::Status { status, .. } => {
                matches!(status, 408 | 429 | 500..=599)
            }
            RemoteFetchError::Decode { .. } => false,
        }
    }
}

impl From<ValidationError> for RemoteFetchError {
    fn from(error: ValidationError) -> Self {
        Self::Decode {
            reason: error.to_string(),
        }
    }
}

/// One page of the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Total rows matching the filters on the server, not the size of this page.
    pub total_count: usize,
}

impl EventPage {
    /// Builds a page from raw rows, dropping the ones that fail validation.
    ///
    /// A non-empty page where every row is rejected points at a schema
    /// mismatch rather than bad data, and fails as a whole.
    pub fn from_records(
        records: Vec<RemoteEventRecord>,
        total_count: usize,
    ) -> Result<Self, ValidationError> {
        let batch = schema::validate_records(records);
        if batch.events.is_empty() && batch.rejected > 0 {
            return Err(ValidationError::AllRowsRejected {
                rejected: batch.rejected,
            });
        }
        Ok(Self {
            events: batch.events,
            total_count,
        })
    }
}

#[async_trait::async_trait]
pub trait RemoteEventSource: Send + Sync + 'static {
    /// `since == None` lists page `page` of everything matching `filters`.
    /// `since == Some(t)` returns only rows changed after `t`; paging
    /// arguments are ignored for that delta query.
    async fn fetch_page(
        &self,
        page: usize,
        page_size: usize,
        filters: &EventFilters,
        since: Option<Timestamp>,
    ) -> Result<EventPage, RemoteFetchError>;

    async fn fetch_by_id(&self, id: &EventId) -> Result<Option<Event>, RemoteFetchError>;

    async fn fetch_latest_server_timestamp(&self) -> Result<Option<Timestamp>, RemoteFetchError>;

    /// Re-validates entities already known locally.
    async fn fetch_changed_since(
        &self,
        ids: &[EventId],
        since: Timestamp,
    ) -> Result<Vec<Event>, RemoteFetchError>;
}
