//! Reconciliation of event collections.
//!
//! Canonical order is `start_time` descending, ties broken by id ascending.
//! Incoming entries always replace existing ones with the same id.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::model::{Event, EventId};

/// Counts reported by [`merge_owned`], mostly for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
}

fn canonical_order(a: &Event, b: &Event) -> Ordering {
    b.start_time
        .cmp(&a.start_time)
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_events(events: &mut [Event]) {
    events.sort_by(canonical_order);
}

/// Pure merge over borrowed collections.
#[must_use]
pub fn merge(existing: &[Event], incoming: &[Event]) -> Vec<Event> {
    merge_owned(existing.to_vec(), incoming.iter().cloned()).0
}

/// Merge that takes ownership, avoiding clones on the hot path.
pub fn merge_owned(
    existing: Vec<Event>,
    incoming: impl IntoIterator<Item = Event>,
) -> (Vec<Event>, MergeStats) {
    let mut by_id: HashMap<EventId, Event> = HashMap::with_capacity(existing.len());
    for event in existing {
        by_id.insert(event.id.clone(), event);
    }

    let mut stats = MergeStats::default();
    for event in incoming {
        match by_id.insert(event.id.clone(), event) {
            Some(_) => stats.replaced += 1,
            None => stats.inserted += 1,
        }
    }

    let mut merged: Vec<Event> = by_id.into_values().collect();
    sort_events(&mut merged);
    (merged, stats)
}

/// True when ids are unique and the order is canonical.
#[must_use]
pub fn is_canonical(events: &[Event]) -> bool {
    let ordered = events
        .windows(2)
        .all(|pair| canonical_order(&pair[0], &pair[1]) == Ordering::Less);
    // non-adjacent duplicates need the hash pass
    let mut seen = std::collections::HashSet::with_capacity(events.len());
    ordered && events.iter().all(|e| seen.insert(&e.id))
}

/// Distinct categories present in the collection, sorted.
#[must_use]
pub fn distinct_categories(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|e| e.category.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn event(id: &str, hour: u32, slots: u32) -> Event {
        Event {
            id: EventId::new(id),
            title: format!("event {id}"),
            description: None,
            location: None,
            start_time: Utc.with_ymd_and_hms(2026, 4, 1, hour, 0, 0).unwrap(),
            category: if hour % 2 == 0 { "music" } else { "sports" }.into(),
            attendees: 0,
            available_slot: slots,
            is_approved: true,
            is_closed: false,
            updated_at: None,
        }
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn incoming_overwrites_and_resorts() {
        let existing = vec![event("a", 10, 5), event("b", 8, 5)];
        let incoming = vec![event("b", 12, 1), event("c", 9, 3)];

        let merged = merge(&existing, &incoming);

        assert_eq!(ids(&merged), vec!["b", "a", "c"]);
        assert_eq!(merged[0].available_slot, 1);
    }

    #[test]
    fn ties_break_by_id() {
        let merged = merge(&[], &[event("z", 10, 0), event("m", 10, 0), event("a", 10, 0)]);
        assert_eq!(ids(&merged), vec!["a", "m", "z"]);
    }

    #[test]
    fn duplicate_ids_in_incoming_keep_last() {
        let (merged, stats) = merge_owned(vec![], vec![event("a", 1, 1), event("a", 1, 7)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].available_slot, 7);
        assert_eq!(stats, MergeStats { inserted: 1, replaced: 1 });
    }

    #[test]
    fn stats_count_inserts_and_replacements() {
        let (_, stats) = merge_owned(
            vec![event("a", 1, 1), event("b", 2, 1)],
            vec![event("b", 2, 0), event("c", 3, 0)],
        );
        assert_eq!(stats, MergeStats { inserted: 1, replaced: 1 });
    }

    #[test]
    fn canonical_check_spots_duplicates_and_disorder() {
        assert!(is_canonical(&[event("a", 10, 0), event("b", 9, 0)]));
        assert!(!is_canonical(&[event("b", 9, 0), event("a", 10, 0)]));
        assert!(!is_canonical(&[event("a", 10, 0), event("a", 10, 0)]));
        assert!(is_canonical(&[]));
    }

    #[test]
    fn categories_are_distinct_and_sorted() {
        let events = vec![event("a", 2, 0), event("b", 3, 0), event("c", 4, 0)];
        assert_eq!(distinct_categories(&events), vec!["music", "sports"]);
    }

    fn arb_events() -> impl Strategy<Value = Vec<Event>> {
        prop::collection::vec((0u8..12, 0u32..24, 0u32..50), 0..24).prop_map(|rows| {
            rows.into_iter()
                .map(|(id, hour, slots)| event(&format!("e{id}"), hour, slots))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merge_output_is_canonical(existing in arb_events(), incoming in arb_events()) {
            let base = merge(&[], &existing);
            let merged = merge(&base, &incoming);
            prop_assert!(is_canonical(&merged));
        }

        #[test]
        fn merge_is_idempotent(existing in arb_events(), incoming in arb_events()) {
            let once = merge(&existing, &incoming);
            let twice = merge(&once, &incoming);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn incoming_always_wins(existing in arb_events(), incoming in arb_events()) {
            let merged = merge(&existing, &incoming);
            let expected = merge(&[], &incoming);
            for event in &expected {
                let found = merged.iter().find(|e| e.id == event.id);
                prop_assert_eq!(found, Some(event));
            }
        }
    }
}
