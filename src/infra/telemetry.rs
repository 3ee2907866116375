use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "regioncache_hit_total",
            Unit::Count,
            "Total number of cache lookups that found a value."
        );
        describe_counter!(
            "regioncache_miss_total",
            Unit::Count,
            "Total number of cache lookups that found nothing."
        );
        describe_counter!(
            "regioncache_compute_total",
            Unit::Count,
            "Total number of factory invocations, labelled by strategy."
        );
        describe_counter!(
            "regioncache_wait_total",
            Unit::Count,
            "Total number of callers that waited on another thread's computation."
        );
        describe_counter!(
            "regioncache_stalled_total",
            Unit::Count,
            "Total number of waits that gave up on a stalled computation."
        );
        describe_counter!(
            "regioncache_reentrant_total",
            Unit::Count,
            "Total number of nested requests for a key already being computed."
        );
        describe_counter!(
            "regioncache_uncached_fallback_total",
            Unit::Count,
            "Total number of lock-free computations that ran uncached after the spin budget."
        );
        describe_counter!(
            "regioncache_store_error_total",
            Unit::Count,
            "Total number of backing store failures, labelled by operation."
        );
        describe_counter!(
            "regioncache_store_evict_total",
            Unit::Count,
            "Total number of in-memory store evictions due to capacity."
        );
        describe_counter!(
            "regioncache_invalidated_keys_total",
            Unit::Count,
            "Total number of keys removed by dependency invalidation."
        );
        describe_gauge!(
            "regioncache_event_queue_len",
            Unit::Count,
            "Current number of pending invalidation events in the queue."
        );
        describe_counter!(
            "regioncache_event_dropped_total",
            Unit::Count,
            "Total number of invalidation events dropped due to queue overflow."
        );
        describe_histogram!(
            "regioncache_consume_ms",
            Unit::Milliseconds,
            "Invalidation consumption latency in milliseconds."
        );
    });
}
