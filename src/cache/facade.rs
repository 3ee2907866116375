//! Cache facade.
//!
//! [`RegionCache`] is what callers hold: typed reads, idempotent writes,
//! get-or-add through the configured stampede guard, and cascade invalidation.

use std::any::{Any, type_name};
use std::convert::Infallible;
use std::sync::Arc;

use metrics::counter;
use tracing::{error, warn};

use super::config::{CacheConfig, RegionPolicies, StrategyKind};
use super::deps::DependencyIndex;
use super::error::{CacheError, StoreError};
use super::guard::Strategy;
use super::keys::QualifiedKey;
use super::store::{KeyedStore, MemoryStore, StoreAdapter, StoredValue};

const METRIC_HIT_TOTAL: &str = "regioncache_hit_total";
const METRIC_MISS_TOTAL: &str = "regioncache_miss_total";
const METRIC_STORE_ERROR_TOTAL: &str = "regioncache_store_error_total";

/// Process-wide compute cache.
///
/// Construct one instance and share it (typically behind an `Arc`); every
/// part of its state is owned here rather than held in statics.
pub struct RegionCache {
    store: StoreAdapter,
    dependencies: DependencyIndex,
    strategy: Strategy,
    policies: RegionPolicies,
}

impl RegionCache {
    /// Create a cache over `backend` using the configured strategy.
    pub fn new(config: &CacheConfig, backend: Arc<dyn KeyedStore>) -> Self {
        Self::with_parts(
            StoreAdapter::new(backend),
            DependencyIndex::new(),
            Strategy::from_config(config),
            RegionPolicies::from_config(config),
        )
    }

    /// Create a cache over a fresh [`MemoryStore`].
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new(config)))
    }

    pub fn with_parts(
        store: StoreAdapter,
        dependencies: DependencyIndex,
        strategy: Strategy,
        policies: RegionPolicies,
    ) -> Self {
        Self {
            store,
            dependencies,
            strategy,
            policies,
        }
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn dependencies(&self) -> &DependencyIndex {
        &self.dependencies
    }

    pub fn policies(&self) -> &RegionPolicies {
        &self.policies
    }

    /// Read `region::key` as `T`.
    ///
    /// A value stored under a different type is a [`CacheError::TypeMismatch`].
    pub fn try_get<T>(&self, key: &str, region: &str) -> Result<Option<T>, CacheError>
    where
        T: Any + Clone,
    {
        let value = self.read::<T>(key, region)?;
        let metric = if value.is_some() {
            METRIC_HIT_TOTAL
        } else {
            METRIC_MISS_TOTAL
        };
        counter!(metric, "region" => region.to_string()).increment(1);
        Ok(value)
    }

    /// Uncounted read shared by [`try_get`](Self::try_get) and the guards' re-checks.
    fn read<T>(&self, key: &str, region: &str) -> Result<Option<T>, CacheError>
    where
        T: Any + Clone,
    {
        let Some(entry) = self.store.get(key, region)? else {
            return Ok(None);
        };

        match entry.value.downcast::<T>() {
            Some(value) => Ok(Some(value)),
            None => {
                let found = entry.value.type_name();
                let expected = type_name::<T>();
                error!(key, region, expected, found, "Cached value has unexpected type");
                Err(CacheError::TypeMismatch {
                    key: key.to_string(),
                    region: region.to_string(),
                    expected,
                    found,
                })
            }
        }
    }

    /// Write `value`, replacing any existing entry, and record its dependencies.
    pub fn store<T>(
        &self,
        key: &str,
        region: &str,
        value: T,
        dependencies: &[&str],
    ) -> Result<(), CacheError>
    where
        T: Any + Send + Sync,
    {
        self.store_optional(key, region, Some(value), dependencies)
    }

    /// Like [`store`](Self::store), but `None` removes the entry instead.
    pub fn store_optional<T>(
        &self,
        key: &str,
        region: &str,
        value: Option<T>,
        dependencies: &[&str],
    ) -> Result<(), CacheError>
    where
        T: Any + Send + Sync,
    {
        let policy = self.policies.resolve(region);

        // The external store may refuse to overwrite silently.
        self.store.remove(key, region)?;
        let Some(value) = value else {
            return Ok(());
        };

        self.store
            .set(key, region, Some(StoredValue::new(value)), policy)?;
        self.dependencies.record_all(key, region, dependencies);
        Ok(())
    }

    /// Return the cached value, or compute it once across concurrent callers.
    pub fn get_or_add<T, F>(
        &self,
        key: &str,
        region: &str,
        factory: F,
        dependencies: &[&str],
    ) -> Result<T, CacheError>
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce() -> T,
    {
        self.get_or_try_add(key, region, || Ok::<T, Infallible>(factory()), dependencies)
    }

    /// [`get_or_add`](Self::get_or_add) with a fallible factory.
    ///
    /// A failed factory caches nothing; its error is returned as
    /// [`CacheError::Factory`].
    pub fn get_or_try_add<T, E, F>(
        &self,
        key: &str,
        region: &str,
        factory: F,
        dependencies: &[&str],
    ) -> Result<T, CacheError>
    where
        T: Any + Send + Sync + Clone,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        F: FnOnce() -> Result<T, E>,
    {
        // One counted read per call; the guards re-check uncounted.
        match self.try_get::<T>(key, region) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(CacheError::Store(err)) => self.note_store_error(key, region, "lookup", &err),
            Err(err) => return Err(err),
        }

        let qualified = QualifiedKey::new(key, region);
        self.strategy.get_or_compute(
            &qualified,
            || self.lookup_for_compute::<T>(key, region),
            factory,
            |value: &T| self.commit(key, region, value.clone(), dependencies),
        )
    }

    /// Remove `region::key`.
    ///
    /// Dependency records pointing at it are left in place; invalidating them
    /// later removes an already-absent key.
    pub fn remove(&self, key: &str, region: &str) -> Result<(), CacheError> {
        self.store.remove(key, region)?;
        Ok(())
    }

    /// Remove every entry recorded against `identifier`.
    pub fn invalidate(&self, identifier: &str) -> Vec<QualifiedKey> {
        self.dependencies.invalidate(identifier, &self.store)
    }

    /// A store failure during get-or-add reads as a miss so the factory still runs.
    fn lookup_for_compute<T>(&self, key: &str, region: &str) -> Result<Option<T>, CacheError>
    where
        T: Any + Clone,
    {
        match self.read::<T>(key, region) {
            Err(CacheError::Store(err)) => {
                self.note_store_error(key, region, "lookup", &err);
                Ok(None)
            }
            other => other,
        }
    }

    /// Best-effort write after a computation; the caller's value is unaffected.
    fn commit<T>(&self, key: &str, region: &str, value: T, dependencies: &[&str])
    where
        T: Any + Send + Sync,
    {
        match self.store(key, region, value, dependencies) {
            Ok(()) => {}
            Err(CacheError::Store(err)) => self.note_store_error(key, region, "commit", &err),
            Err(err) => warn!(key, region, error = %err, "Failed to cache computed value"),
        }
    }

    fn note_store_error(&self, key: &str, region: &str, op: &'static str, err: &StoreError) {
        warn!(key, region, op, error = %err, "Cache store unavailable; continuing uncached");
        counter!(METRIC_STORE_ERROR_TOTAL, "op" => op).increment(1);
    }
}
