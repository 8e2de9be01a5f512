use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteFetchError;
use crate::schema::ValidationError;
use crate::store::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NetworkUnavailable,
    RemoteFetch,
    Storage,
    Validation,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::RemoteFetch => "REMOTE_FETCH_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Validation => "VALIDATION_ERROR",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable | Self::RemoteFetch | Self::Storage
        )
    }
}

/// Everything the cache controller can run into. None of it escapes a command:
/// it is folded into [`DisplayError`] on the observable snapshot.
///
/// An event that does not exist is not an error: lookups answer `None`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("remote fetch failed: {0}")]
    RemoteFetch(RemoteFetchError),

    #[error("local storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid remote payload: {0}")]
    Validation(#[from] ValidationError),
}

impl CacheError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkUnavailable => ErrorKind::NetworkUnavailable,
            Self::RemoteFetch(_) => ErrorKind::RemoteFetch,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteFetch(e) => e.is_retryable(),
            other => other.kind().is_retryable(),
        }
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::NetworkUnavailable => {
                "You're offline. Connect to the internet to load more events.".into()
            }
            Self::RemoteFetch(RemoteFetchError::Timeout { .. }) => {
                "The server took too long to respond. Please try again.".into()
            }
            Self::RemoteFetch(_) => {
                "We couldn't reach the server. Showing saved events for now.".into()
            }
            Self::Storage(_) => {
                "Unable to save events on this device. Please free up some storage space."
                    .into()
            }
            Self::Validation(_) => {
                "Some event data could not be read. Please refresh and try again.".into()
            }
        }
    }
}

/// A response the backend sent but that could not be read is a payload
/// problem, not a connectivity one.
impl From<RemoteFetchError> for CacheError {
    fn from(error: RemoteFetchError) -> Self {
        match error {
            RemoteFetchError::Decode { reason } => {
                Self::Validation(ValidationError::Malformed(reason))
            }
            other => Self::RemoteFetch(other),
        }
    }
}

/// The user-displayable form of a [`CacheError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DisplayError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<&CacheError> for DisplayError {
    fn from(error: &CacheError) -> Self {
        Self {
            kind: error.kind(),
            message: error.user_facing_message(),
        }
    }
}

impl std::fmt::Display for DisplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}
