//! Cache storage.
//!
//! [`KeyedStore`] is the boundary to the external key/value store.
//! [`StoreAdapter`] sits in front of it and owns the absent-value convention.
//! [`MemoryStore`] is the in-process backend used by default.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use super::config::{CacheConfig, ExpirationPolicy};
use super::error::StoreError;
use super::keys::QualifiedKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_STORE_EVICT_TOTAL: &str = "regioncache_store_evict_total";

/// Type-erased cached value.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// A cached value together with the name of the type it was stored as.
#[derive(Clone)]
pub struct StoredValue {
    value: CacheValue,
    type_name: &'static str,
}

impl StoredValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Clone the value out if it was stored as `T`.
    pub fn downcast<T: Any + Clone>(&self) -> Option<T> {
        self.value.downcast_ref::<T>().cloned()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Cache entry as held by the store.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub region: String,
    pub value: StoredValue,
    pub inserted_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, region: impl Into<String>, value: StoredValue) -> Self {
        Self {
            key: key.into(),
            region: region.into(),
            value,
            inserted_at: OffsetDateTime::now_utc(),
        }
    }
}

/// External key/value store.
///
/// Implementations must be thread-safe; no other concurrency is assumed.
pub trait KeyedStore: Send + Sync {
    fn get(&self, key: &str, region: &str) -> Result<Option<CacheEntry>, StoreError>;

    fn set(&self, entry: CacheEntry, policy: ExpirationPolicy) -> Result<(), StoreError>;

    fn remove(&self, key: &str, region: &str) -> Result<(), StoreError>;
}

/// Thin adapter over a [`KeyedStore`].
///
/// Writing an absent value removes the entry, so "not computed" and
/// "computed but empty" never share a representation.
#[derive(Clone)]
pub struct StoreAdapter {
    backend: Arc<dyn KeyedStore>,
}

impl StoreAdapter {
    pub fn new(backend: Arc<dyn KeyedStore>) -> Self {
        Self { backend }
    }

    pub fn get(&self, key: &str, region: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.backend.get(key, region)
    }

    pub fn set(
        &self,
        key: &str,
        region: &str,
        value: Option<StoredValue>,
        policy: ExpirationPolicy,
    ) -> Result<(), StoreError> {
        match value {
            Some(value) => self
                .backend
                .set(CacheEntry::new(key, region, value), policy),
            None => self.backend.remove(key, region),
        }
    }

    pub fn remove(&self, key: &str, region: &str) -> Result<(), StoreError> {
        self.backend.remove(key, region)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

struct Slot {
    entry: CacheEntry,
    policy: ExpirationPolicy,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// In-process [`KeyedStore`] with LRU eviction and per-entry expiry.
///
/// Expired entries read as absent and are dropped on access.
pub struct MemoryStore {
    entries: Mutex<LruCache<QualifiedKey, Slot>>,
}

impl MemoryStore {
    /// Create a new store sized from the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.store_capacity_non_zero())),
        }
    }

    /// Get the number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all stored entries.
    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }
}

impl KeyedStore for MemoryStore {
    fn get(&self, key: &str, region: &str) -> Result<Option<CacheEntry>, StoreError> {
        let lookup = QualifiedKey::new(key, region);
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let now = Instant::now();

        match entries.get_mut(&lookup) {
            None => return Ok(None),
            Some(slot) if slot.is_live(now) => {
                if let ExpirationPolicy::Sliding(ttl) = slot.policy {
                    slot.expires_at = deadline(now, ttl);
                }
                return Ok(Some(slot.entry.clone()));
            }
            Some(_) => {}
        }

        entries.pop(&lookup);
        Ok(None)
    }

    fn set(&self, entry: CacheEntry, policy: ExpirationPolicy) -> Result<(), StoreError> {
        let key = QualifiedKey::new(entry.key.clone(), entry.region.clone());
        let slot = Slot {
            entry,
            policy,
            expires_at: deadline(Instant::now(), policy.ttl()),
        };

        let evicted = mutex_lock(&self.entries, SOURCE, "set").push(key.clone(), slot);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            counter!(METRIC_STORE_EVICT_TOTAL, "region" => evicted_key.region).increment(1);
        }
        Ok(())
    }

    fn remove(&self, key: &str, region: &str) -> Result<(), StoreError> {
        mutex_lock(&self.entries, SOURCE, "remove").pop(&QualifiedKey::new(key, region));
        Ok(())
    }
}
