//! Dependency index for cascade invalidation.
//!
//! Tracks, for each upstream identifier, the cache keys whose values were
//! computed from it. The map is only walked forward (identifier → keys);
//! removing a single cache entry leaves its associations in place, and the
//! next invalidation of those identifiers simply removes an already-absent key.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use metrics::counter;
use tracing::{debug, warn};

use super::keys::QualifiedKey;
use super::lock::mutex_lock;
use super::store::StoreAdapter;

const SOURCE: &str = "cache::deps";
const METRIC_INVALIDATED_KEYS_TOTAL: &str = "regioncache_invalidated_keys_total";

/// Identifier → dependent cache keys, guarded by one coarse lock.
pub struct DependencyIndex {
    records: Mutex<HashMap<String, HashSet<QualifiedKey>>>,
}

impl DependencyIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `region::key` was computed from `identifier`.
    pub fn record_dependency(&self, key: &str, region: &str, identifier: &str) {
        self.record_all(key, region, &[identifier]);
    }

    /// Record several identifiers for one key under a single lock acquisition.
    ///
    /// An empty list records nothing.
    pub fn record_all(&self, key: &str, region: &str, identifiers: &[&str]) {
        if identifiers.is_empty() {
            return;
        }

        let dependent = QualifiedKey::new(key, region);
        let mut records = mutex_lock(&self.records, SOURCE, "record_all");
        for identifier in identifiers {
            records
                .entry((*identifier).to_string())
                .or_default()
                .insert(dependent.clone());
        }
    }

    /// Remove every entry recorded against `identifier` and drop its record.
    ///
    /// Returns the keys removed from the store, sorted. Keys whose removal
    /// failed are logged and recorded against `identifier` again, so the next
    /// invalidation retries them.
    pub fn invalidate(&self, identifier: &str, store: &StoreAdapter) -> Vec<QualifiedKey> {
        let dependents = mutex_lock(&self.records, SOURCE, "invalidate").remove(identifier);
        let Some(dependents) = dependents else {
            debug!(identifier, "No cache entries depend on identifier");
            return Vec::new();
        };

        let (mut removed, failed): (Vec<QualifiedKey>, Vec<QualifiedKey>) = dependents
            .into_iter()
            .partition(|dependent| match store.remove(&dependent.key, &dependent.region) {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        identifier,
                        key = %dependent.key,
                        region = %dependent.region,
                        error = %err,
                        "Failed to remove dependent cache entry; keeping it for retry"
                    );
                    false
                }
            });
        removed.sort();

        if !failed.is_empty() {
            let mut records = mutex_lock(&self.records, SOURCE, "invalidate_retry");
            records
                .entry(identifier.to_string())
                .or_default()
                .extend(failed);
        }

        counter!(METRIC_INVALIDATED_KEYS_TOTAL).increment(removed.len() as u64);
        debug!(identifier, removed = removed.len(), "Identifier invalidated");
        removed
    }

    /// Keys currently recorded against `identifier`.
    pub fn dependents(&self, identifier: &str) -> HashSet<QualifiedKey> {
        mutex_lock(&self.records, SOURCE, "dependents")
            .get(identifier)
            .cloned()
            .unwrap_or_default()
    }

    /// Get the number of tracked identifiers.
    pub fn identifier_count(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "identifier_count").len()
    }

    /// Clear all records.
    pub fn clear(&self) {
        mutex_lock(&self.records, SOURCE, "clear").clear();
    }
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new()
    }
}
