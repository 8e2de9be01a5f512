use serde::{Deserialize, Serialize};

use super::StorageError;
use crate::model::EventId;

pub const MAX_KEY_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Event,
    Detail,
    Meta,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Event => "event",
            KeyNamespace::Detail => "detail",
            KeyNamespace::Meta => "meta",
        }
    }

    /// `LIKE` pattern matching every key in the namespace.
    pub fn like_pattern(&self) -> String {
        format!("{}:%", self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    namespace: KeyNamespace,
    key: String,
}

impl StoreKey {
    pub const SYNC_CURSOR: &'static str = "sync_cursor";
    pub const TOTAL_COUNT: &'static str = "total_count";
    pub const LOADED_PAGES: &'static str = "loaded_pages";

    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn event(id: &EventId) -> Result<Self, StorageError> {
        Self::new(KeyNamespace::Event, id.as_str())
    }

    pub fn detail(id: &EventId) -> Result<Self, StorageError> {
        Self::new(KeyNamespace::Detail, id.as_str())
    }

    pub fn meta(name: &'static str) -> Result<Self, StorageError> {
        Self::new(KeyNamespace::Meta, name)
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    fn validate_key(key: &str) -> Result<(), StorageError> {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(StorageError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(StorageError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}
