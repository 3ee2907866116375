//! Runtime bootstrap for the regioncache binary.

pub mod error;
pub mod telemetry;
