//! Invalidation plan generation.
//!
//! Merges a batch of invalidation events into the list of identifiers to
//! invalidate, each once.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::events::{Epoch, InvalidationEvent};

/// Identifiers to invalidate for one consumption batch.
#[derive(Debug, Default)]
pub struct InvalidationPlan {
    /// Identifiers ordered by the latest epoch seen for each.
    pub identifiers: Vec<String>,
    /// Events in the batch, duplicates included.
    pub event_count: usize,
    /// Events folded into an earlier one (same event id or same identifier).
    pub merged_count: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ identifiers: {}, events: {}, merged: {} }}",
            self.identifiers.len(),
            self.event_count,
            self.merged_count,
        )
    }
}

impl InvalidationPlan {
    /// Merge events into a plan.
    ///
    /// - Deduplicates by event ID
    /// - Groups by identifier, keeping the latest epoch
    pub fn from_events(events: Vec<InvalidationEvent>) -> Self {
        let event_count = events.len();
        let mut seen_ids = HashSet::new();
        let mut latest: HashMap<String, Epoch> = HashMap::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            let epoch = latest.entry(event.identifier).or_insert(event.epoch);
            *epoch = (*epoch).max(event.epoch);
        }

        let mut ordered: Vec<(String, Epoch)> = latest.into_iter().collect();
        ordered.sort_by_key(|(_, epoch)| *epoch);

        let identifiers: Vec<String> = ordered.into_iter().map(|(id, _)| id).collect();
        Self {
            merged_count: event_count - identifiers.len(),
            identifiers,
            event_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}
