//! Regioncache Cache System
//!
//! Composes three layers behind [`RegionCache`]:
//!
//! - **Store adapter**: wraps the external key/value store and resolves the
//!   absent-value convention
//! - **Dependency index**: maps upstream identifiers to the cache keys computed
//!   from them
//! - **Stampede guard**: ensures one computation per `region::key` at a time,
//!   either through a lock table or a lock-free slot array
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! strategy = "lock_free"
//! spin_timeout_ms = 10
//! default_expiration_secs = 300
//!
//! [cache.regions]
//! Page = 60
//! EntityModel = { sliding = 120 }
//! ```

mod config;
mod consumer;
pub mod deps;
mod error;
mod events;
mod facade;
pub mod guard;
mod keys;
mod lock;
mod planner;
mod store;

pub use config::{CacheConfig, ExpirationPolicy, RegionExpiration, RegionPolicies, StrategyKind};
pub use consumer::{ConsumeSummary, InvalidationConsumer};
pub use deps::DependencyIndex;
pub use error::{CacheError, StoreError};
pub use events::{Epoch, EventQueue, InvalidationEvent};
pub use facade::RegionCache;
pub use guard::{LockFreeGuard, LockTableGuard, Strategy};
pub use keys::{QualifiedKey, hash_qualified, hash_value};
pub use planner::InvalidationPlan;
pub use store::{CacheEntry, CacheValue, KeyedStore, MemoryStore, StoreAdapter, StoredValue};
