//! Stampede guards.
//!
//! Both strategies take the same four inputs: the qualified key, a lookup
//! against the cache, the factory and a commit that writes the computed value.
//! [`Strategy`] selects one per deployment; their state is never shared.

mod lock_free;
mod lock_table;

pub use lock_free::LockFreeGuard;
pub use lock_table::LockTableGuard;

use super::config::{CacheConfig, StrategyKind};
use super::error::CacheError;
use super::keys::QualifiedKey;

/// The stampede guard configured for this process.
pub enum Strategy {
    LockTable(LockTableGuard),
    LockFree(LockFreeGuard),
}

impl Strategy {
    pub fn from_config(config: &CacheConfig) -> Self {
        match config.strategy {
            StrategyKind::LockTable => Self::LockTable(LockTableGuard::new(config.lock_timeout())),
            StrategyKind::LockFree => Self::LockFree(LockFreeGuard::new(
                config.slot_table_size_prime(),
                config.spin_timeout(),
            )),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::LockTable(_) => StrategyKind::LockTable,
            Self::LockFree(_) => StrategyKind::LockFree,
        }
    }

    pub fn get_or_compute<T, E, L, F, C>(
        &self,
        key: &QualifiedKey,
        lookup: L,
        factory: F,
        commit: C,
    ) -> Result<T, CacheError>
    where
        L: Fn() -> Result<Option<T>, CacheError>,
        F: FnOnce() -> Result<T, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        C: FnOnce(&T),
    {
        match self {
            Self::LockTable(guard) => guard.get_or_compute(key, lookup, factory, commit),
            Self::LockFree(guard) => guard.get_or_compute(key, lookup, factory, commit),
        }
    }
}
