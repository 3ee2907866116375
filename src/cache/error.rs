//! Cache error types.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the external key/value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The computing thread did not finish within two wait periods.
    #[error("computation for `{region}::{key}` stalled: no value after {waited:?}")]
    StalledComputation {
        key: String,
        region: String,
        waited: Duration,
    },
    /// Two call sites disagree on what a key/region holds.
    #[error("cached value for `{region}::{key}` is `{found}` but `{expected}` was requested")]
    TypeMismatch {
        key: String,
        region: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("`{region}::{key}` requested again by the thread already computing it")]
    ReentrantComputation { key: String, region: String },
    #[error("factory failed: {0}")]
    Factory(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    pub fn stalled(key: &str, region: &str, waited: Duration) -> Self {
        Self::StalledComputation {
            key: key.to_string(),
            region: region.to_string(),
            waited,
        }
    }

    pub fn reentrant(key: &str, region: &str) -> Self {
        Self::ReentrantComputation {
            key: key.to_string(),
            region: region.to_string(),
        }
    }

    pub fn factory(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Factory(error.into())
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::StalledComputation { .. })
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }
}
