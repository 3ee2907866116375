//! Cache key definitions.
//!
//! A cache entry is addressed by an opaque key inside a named region. The pair
//! is qualified as `region::key` wherever a single string or hash is needed.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator between region and key in the qualified form.
pub const QUALIFIER: &str = "::";

/// A key together with the region it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedKey {
    pub region: String,
    pub key: String,
}

impl QualifiedKey {
    pub fn new(key: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            key: key.into(),
        }
    }

    /// The `region::key` form used by the lock table.
    pub fn qualified(&self) -> String {
        format!("{}{QUALIFIER}{}", self.region, self.key)
    }

    pub fn hash_code(&self) -> u64 {
        hash_qualified(&self.key, &self.region)
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{QUALIFIER}{}", self.region, self.key)
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hash the qualified `region::key` form without allocating it.
pub fn hash_qualified(key: &str, region: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(region.as_bytes());
    hasher.write(QUALIFIER.as_bytes());
    hasher.write(key.as_bytes());
    hasher.finish()
}
