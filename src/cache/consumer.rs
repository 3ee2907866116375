//! Invalidation consumer.
//!
//! Drains the event queue and applies each planned identifier to the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::histogram;
use tracing::{debug, info, instrument};

use super::config::CacheConfig;
use super::events::EventQueue;
use super::facade::RegionCache;
use super::planner::InvalidationPlan;

const METRIC_CONSUME_MS: &str = "regioncache_consume_ms";

/// Outcome of one consumption batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub events: usize,
    pub identifiers: usize,
    pub removed_keys: usize,
}

impl ConsumeSummary {
    pub fn is_empty(&self) -> bool {
        self.events == 0
    }
}

/// Applies queued invalidation events to a [`RegionCache`].
pub struct InvalidationConsumer {
    cache: Arc<RegionCache>,
    queue: Arc<EventQueue>,
    batch_limit: usize,
}

impl InvalidationConsumer {
    pub fn new(config: &CacheConfig, cache: Arc<RegionCache>, queue: Arc<EventQueue>) -> Self {
        Self {
            cache,
            queue,
            batch_limit: config.consume_batch_limit.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Consume one batch of pending events.
    #[instrument(skip(self))]
    pub fn consume(&self) -> ConsumeSummary {
        let started_at = Instant::now();
        let events = self.queue.drain(self.batch_limit);
        if events.is_empty() {
            return ConsumeSummary::default();
        }

        let plan = InvalidationPlan::from_events(events);
        info!(plan = %plan, "Invalidation consumption starting");

        let removed_keys = plan
            .identifiers
            .iter()
            .map(|identifier| self.cache.invalidate(identifier).len())
            .sum();

        let summary = ConsumeSummary {
            events: plan.event_count,
            identifiers: plan.identifiers.len(),
            removed_keys,
        };
        info!(
            events = summary.events,
            identifiers = summary.identifiers,
            removed_keys = summary.removed_keys,
            "Invalidation consumption complete"
        );

        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        summary
    }

    /// Consume batches until the queue is empty.
    #[instrument(skip(self))]
    pub fn consume_all(&self) -> ConsumeSummary {
        let mut total = ConsumeSummary::default();
        loop {
            let batch = self.consume();
            if batch.is_empty() {
                return total;
            }
            total.events += batch.events;
            total.identifiers += batch.identifiers;
            total.removed_keys += batch.removed_keys;
        }
    }

    /// Consume on a background thread every `interval` until `stop` is set.
    ///
    /// Pending events are drained once more before the thread exits.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("regioncache-invalidation".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    self.consume_all();
                }
                let last = self.consume_all();
                debug!(events = last.events, "Invalidation consumer stopped");
            })
    }
}
