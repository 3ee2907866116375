//! regioncache: a get-or-compute cache for expensive content lookups.
//!
//! Values are keyed by an opaque string within a named region. Concurrent
//! callers asking for the same missing value trigger exactly one computation,
//! and cached values can be dropped in bulk when an upstream item they were
//! computed from changes.

pub mod cache;
pub mod config;
pub mod infra;
