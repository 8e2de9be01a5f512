//! Strict schema at the remote boundary.
//!
//! Rows arrive loosely typed (numeric or string ids, snake_case or camelCase
//! keys, string timestamps). They are normalized into [`Event`] here, and
//! anything malformed is rejected before it can reach the merge step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Event, EventId, Timestamp, DEFAULT_CATEGORY};

pub const MAX_ID_LEN: usize = 128;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 8192;
pub const MAX_CATEGORY_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("{field} must not be negative (got {value})")]
    NegativeCount { field: &'static str, value: i64 },
    #[error("{field} out of range (got {value})")]
    CountOutOfRange { field: &'static str, value: i64 },
    #[error("{field} too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("all {rejected} rows in the batch were rejected")]
    AllRowsRejected { rejected: usize },
}

// --- Bounded text ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BoundedText<const MAX: usize>(String);

impl<const MAX: usize> BoundedText<MAX> {
    pub fn new(field: &'static str, s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        if s.len() > MAX {
            return Err(ValidationError::TooLong {
                field,
                len: s.len(),
                max: MAX,
            });
        }
        Ok(Self(s))
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

pub type Title = BoundedText<MAX_TITLE_LEN>;
pub type Description = BoundedText<MAX_DESCRIPTION_LEN>;
pub type Category = BoundedText<MAX_CATEGORY_LEN>;

/// A row as the backend sends it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEventRecord {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "start_time")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub attendees: Option<i64>,
    #[serde(default, alias = "available_slot")]
    pub available_slot: Option<i64>,
    #[serde(default, alias = "is_approved")]
    pub is_approved: Option<bool>,
    #[serde(default, alias = "is_closed")]
    pub is_closed: Option<bool>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<String>,
}

fn parse_id(value: Option<Value>) -> Result<EventId, ValidationError> {
    let raw = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(ValidationError::InvalidId(other.to_string())),
        None => return Err(ValidationError::MissingField("id")),
    };

    if raw.is_empty() || raw.len() > MAX_ID_LEN || raw.chars().any(char::is_control) {
        return Err(ValidationError::InvalidId(raw));
    }
    Ok(EventId::new(raw))
}

fn parse_time(field: &'static str, value: &str) -> Result<Timestamp, ValidationError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

fn parse_count(field: &'static str, value: Option<i64>) -> Result<u32, ValidationError> {
    let value = value.unwrap_or(0);
    if value < 0 {
        return Err(ValidationError::NegativeCount { field, value });
    }
    u32::try_from(value).map_err(|_| ValidationError::CountOutOfRange { field, value })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl TryFrom<RemoteEventRecord> for Event {
    type Error = ValidationError;

    fn try_from(record: RemoteEventRecord) -> Result<Self, Self::Error> {
        let id = parse_id(record.id)?;

        let title = non_blank(record.title).ok_or(ValidationError::MissingField("title"))?;
        let title = Title::new("title", title)?.into_inner();

        let description = non_blank(record.description)
            .map(|d| Description::new("description", d).map(Description::into_inner))
            .transpose()?;

        let start_time = record
            .start_time
            .as_deref()
            .ok_or(ValidationError::MissingField("startTime"))
            .and_then(|s| parse_time("startTime", s))?;

        let updated_at = record
            .updated_at
            .as_deref()
            .map(|s| parse_time("updatedAt", s))
            .transpose()?;

        let category = non_blank(record.category)
            .map(|c| c.to_lowercase())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let category = Category::new("category", category)?.into_inner();

        Ok(Event {
            id,
            title,
            description,
            location: non_blank(record.location),
            start_time,
            category,
            attendees: parse_count("attendees", record.attendees)?,
            available_slot: parse_count("availableSlot", record.available_slot)?,
            is_approved: record.is_approved.unwrap_or(false),
            is_closed: record.is_closed.unwrap_or(false),
            updated_at,
        })
    }
}

/// Valid events from a batch plus how many rows were thrown away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBatch {
    pub events: Vec<Event>,
    pub rejected: usize,
}

pub fn validate_records(records: Vec<RemoteEventRecord>) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    for record in records {
        match Event::try_from(record) {
            Ok(event) => batch.events.push(event),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed event record");
                batch.rejected += 1;
            }
        }
    }
    batch
}

/// Decodes a JSON array of rows. A row with the wrong shape is rejected on its
/// own; only a payload that is not an array fails as a whole.
pub fn decode_batch(json: &[u8]) -> Result<DecodedBatch, ValidationError> {
    let rows: Vec<Value> =
        serde_json::from_slice(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    let mut records = Vec::with_capacity(rows.len());
    let mut shape_rejects = 0;
    for row in rows {
        match serde_json::from_value::<RemoteEventRecord>(row) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(error = %e, "dropping event row with unexpected shape");
                shape_rejects += 1;
            }
        }
    }

    let mut batch = validate_records(records);
    batch.rejected += shape_rejects;
    Ok(batch)
}

/// Decodes a single row, e.g. a realtime push payload.
pub fn decode_event(json: &[u8]) -> Result<Event, ValidationError> {
    let record: RemoteEventRecord =
        serde_json::from_slice(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    Event::try_from(record)
}
