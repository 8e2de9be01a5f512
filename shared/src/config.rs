use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_MAX_DETAIL_RECORDS: usize = 256;
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("unreadable config: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fixed per deployment.
    pub page_size: usize,
    /// Capacity of the standalone detail records kept for events outside the list.
    pub max_detail_records: usize,
    pub max_page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_detail_records: DEFAULT_MAX_DETAIL_RECORDS,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be > 0".into()));
        }
        if self.max_page_size == 0 {
            return Err(ConfigError::Invalid("max_page_size must be > 0".into()));
        }
        if self.page_size > self.max_page_size {
            return Err(ConfigError::Invalid(format!(
                "page_size {} exceeds max_page_size {}",
                self.page_size, self.max_page_size
            )));
        }
        if self.max_detail_records == 0 {
            return Err(ConfigError::Invalid(
                "max_detail_records must be > 0".into(),
            ));
        }
        Ok(())
    }
}
