//! Cache configuration.
//!
//! Controls the stampede strategy, wait timeouts and per-region expiration via
//! the `[cache]` table of `regioncache.toml`.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SPIN_TIMEOUT_MS: u64 = 10;
const DEFAULT_SLOT_TABLE_SIZE: usize = 4099;
const DEFAULT_EXPIRATION_SECS: u64 = 300;
const DEFAULT_STORE_CAPACITY: usize = 10_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 4096;

/// Which stampede guard a deployment runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Named markers with bounded blocking waits.
    #[default]
    LockTable,
    /// Hashed slot ownership with a short spin and uncached fallback.
    LockFree,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockTable => "lock_table",
            Self::LockFree => "lock_free",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "lock_table" | "locktable" => Ok(Self::LockTable),
            "lock_free" | "lockfree" => Ok(Self::LockFree),
            other => Err(format!(
                "unknown strategy `{other}` (expected lock_table or lock_free)"
            )),
        }
    }
}

/// Expiration handed to the external store, unchanged, with every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    /// Entry expires a fixed time after it was written.
    Absolute(Duration),
    /// Entry expires after a period without reads.
    Sliding(Duration),
}

impl ExpirationPolicy {
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Absolute(ttl) | Self::Sliding(ttl) => *ttl,
        }
    }

    pub fn is_sliding(&self) -> bool {
        matches!(self, Self::Sliding(_))
    }
}

/// Region expiration as written in configuration.
///
/// A bare number means absolute seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RegionExpiration {
    Seconds(u64),
    Absolute { absolute: u64 },
    Sliding { sliding: u64 },
}

impl From<RegionExpiration> for ExpirationPolicy {
    fn from(value: RegionExpiration) -> Self {
        match value {
            RegionExpiration::Seconds(secs) | RegionExpiration::Absolute { absolute: secs } => {
                ExpirationPolicy::Absolute(Duration::from_secs(secs))
            }
            RegionExpiration::Sliding { sliding } => {
                ExpirationPolicy::Sliding(Duration::from_secs(sliding))
            }
        }
    }
}

/// Cache configuration from `regioncache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Stampede guard used for every region.
    pub strategy: StrategyKind,
    /// Lock-table wait period (ms); a stalled computation fails after two.
    pub lock_timeout_ms: u64,
    /// Lock-free spin budget (ms) before computing without caching.
    pub spin_timeout_ms: u64,
    /// Lock-free slot count; rounded up to the next prime.
    pub slot_table_size: usize,
    /// Absolute expiration (s) for regions without their own entry.
    pub default_expiration_secs: u64,
    /// Region name to expiration.
    pub regions: HashMap<String, RegionExpiration>,
    /// Maximum entries held by the in-memory store.
    pub store_capacity: usize,
    /// Maximum invalidation events per consumption batch.
    pub consume_batch_limit: usize,
    /// Background invalidation consume interval (ms).
    pub auto_consume_interval_ms: u64,
    /// Pending invalidation events kept before the oldest are dropped.
    pub event_queue_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            spin_timeout_ms: DEFAULT_SPIN_TIMEOUT_MS,
            slot_table_size: DEFAULT_SLOT_TABLE_SIZE,
            default_expiration_secs: DEFAULT_EXPIRATION_SECS,
            regions: HashMap::new(),
            store_capacity: DEFAULT_STORE_CAPACITY,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
        }
    }
}

impl CacheConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn spin_timeout(&self) -> Duration {
        Duration::from_millis(self.spin_timeout_ms)
    }

    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms)
    }

    /// Slot table size rounded up to a prime to spread hash clustering.
    pub fn slot_table_size_prime(&self) -> usize {
        next_prime(self.slot_table_size)
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn default_policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::Absolute(Duration::from_secs(self.default_expiration_secs))
    }
}

/// Region expiration resolved once from configuration.
///
/// Region names are matched case-insensitively.
#[derive(Debug, Clone)]
pub struct RegionPolicies {
    policies: HashMap<String, ExpirationPolicy>,
    default: ExpirationPolicy,
}

impl RegionPolicies {
    pub fn from_config(config: &CacheConfig) -> Self {
        let policies = config
            .regions
            .iter()
            .map(|(region, expiration)| (region.to_ascii_lowercase(), (*expiration).into()))
            .collect();
        Self {
            policies,
            default: config.default_policy(),
        }
    }

    pub fn resolve(&self, region: &str) -> ExpirationPolicy {
        self.policies
            .get(&region.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

fn next_prime(value: usize) -> usize {
    let mut candidate = value.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

fn is_prime(value: usize) -> bool {
    if value < 2 {
        return false;
    }
    if value % 2 == 0 {
        return value == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= value {
        if value % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}
