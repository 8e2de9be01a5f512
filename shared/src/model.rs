use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::DisplayError;

/// Server instants. Serialized as RFC 3339 / ISO-8601.
pub type Timestamp = DateTime<Utc>;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(EventId);

pub const DEFAULT_CATEGORY: &str = "general";

/// A listed event. Every view refers to the same logical record by `id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start_time: Timestamp,
    pub category: String,
    pub attendees: u32,
    pub available_slot: u32,
    pub is_approved: bool,
    pub is_closed: bool,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl Event {
    #[must_use]
    pub fn is_sold_out(&self) -> bool {
        self.available_slot == 0
    }

    /// Applies a provisional counter change. Counters saturate at their bounds.
    pub fn apply_delta(&mut self, delta: MutationDelta) {
        self.attendees = self.attendees.saturating_add_signed(delta.attendees);
        self.available_slot = self.available_slot.saturating_add_signed(delta.available_slot);
    }

    /// Whether this event passes the listing filters. Filters are expected normalized.
    #[must_use]
    pub fn matches(&self, filters: &EventFilters) -> bool {
        if let Some(category) = &filters.category {
            if !self.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }

        let Some(query) = &filters.query else {
            return true;
        };
        let query = query.to_lowercase();
        let contains = |field: Option<&str>| {
            field.is_some_and(|value| value.to_lowercase().contains(&query))
        };

        contains(Some(&self.title))
            || contains(self.description.as_deref())
            || contains(self.location.as_deref())
    }
}

/// Search and category filters forwarded to the remote listing.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventFilters {
    pub query: Option<String>,
    pub category: Option<String>,
}

impl EventFilters {
    #[must_use]
    pub fn new(query: Option<&str>, category: Option<&str>) -> Self {
        Self {
            query: query.map(str::to_string),
            category: category.map(str::to_string),
        }
        .normalized()
    }

    /// Trims both fields, lowercases the category and turns blanks into `None`.
    #[must_use]
    pub fn normalized(self) -> Self {
        let clean = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            query: clean(self.query),
            category: clean(self.category).map(|c| c.to_lowercase()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.category.is_none()
    }
}

/// Counter change applied by an optimistic mutation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MutationDelta {
    pub attendees: i32,
    pub available_slot: i32,
}

impl MutationDelta {
    /// `quantity` tickets bought: attendees go up, free slots go down.
    #[must_use]
    pub fn ticket_purchase(quantity: u16) -> Self {
        let quantity = i32::from(quantity);
        Self {
            attendees: quantity,
            available_slot: -quantity,
        }
    }
}

/// A provisional local change not yet confirmed by the server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingMutation {
    pub mutation_id: Uuid,
    pub event_id: EventId,
    pub delta: MutationDelta,
    pub applied_at: Timestamp,
}

impl PendingMutation {
    #[must_use]
    pub fn new(event_id: EventId, delta: MutationDelta) -> Self {
        Self {
            mutation_id: Uuid::new_v4(),
            event_id,
            delta,
            applied_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    #[default]
    Empty,
    Loading,
    Ready,
    Error,
}

/// What the UI layer observes. Every field is a snapshot of controller state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CacheSnapshot {
    pub status: CacheStatus,
    pub displayed_events: Vec<Event>,
    pub is_loading: bool,
    pub is_syncing: bool,
    pub has_more: bool,
    pub error: Option<DisplayError>,
    pub categories: Vec<String>,
    pub current_page: usize,
    pub total_count: usize,
    pub pending_mutations: usize,
}
