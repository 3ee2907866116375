//! Invalidation event queue.
//!
//! External notifiers (a message bus listener, an admin hook) publish the
//! identifier of an upstream item that changed; the consumer drains the queue
//! and cascades the invalidation through the dependency index.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const DEFAULT_QUEUE_LIMIT: usize = 4096;
const METRIC_EVENT_QUEUE_LEN: &str = "regioncache_event_queue_len";
const METRIC_EVENT_DROPPED_TOTAL: &str = "regioncache_event_dropped_total";

/// Monotonic epoch for ordering events.
///
/// Each event gets a unique, monotonically increasing epoch number.
pub type Epoch = u64;

/// Notification that an upstream item changed.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    /// Dependency identifier, as passed to `store`.
    pub identifier: String,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(identifier: impl Into<String>, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            identifier: identifier.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// In-memory event queue for cache invalidation.
///
/// Bounded; when full, the oldest pending event is dropped.
pub struct EventQueue {
    queue: Mutex<VecDeque<InvalidationEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    /// Create a new empty event queue.
    pub fn new() -> Self {
        Self::new_with_limit(DEFAULT_QUEUE_LIMIT)
    }

    /// Create a queue that keeps at most `limit` pending events.
    pub fn new_with_limit(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an invalidation for `identifier`.
    pub fn publish(&self, identifier: impl Into<String>) -> Epoch {
        let event = InvalidationEvent::new(identifier, self.next_epoch());
        self.push(event)
    }

    /// Enqueue an event built elsewhere, e.g. replayed from a transport.
    pub fn push(&self, event: InvalidationEvent) -> Epoch {
        let epoch = event.epoch;
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            identifier = %event.identifier,
            "Invalidation event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "push");
        if queue.len() >= self.limit
            && let Some(dropped) = queue.pop_front()
        {
            warn!(
                event_id = %dropped.id,
                identifier = %dropped.identifier,
                limit = self.limit,
                "Invalidation queue full; dropped oldest event"
            );
            counter!(METRIC_EVENT_DROPPED_TOTAL).increment(1);
        }
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        epoch
    }

    /// Drain up to `limit` events from the queue.
    ///
    /// Returns the events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<InvalidationEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all events from the queue.
    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
