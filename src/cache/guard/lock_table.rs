//! Lock-table stampede guard.
//!
//! One completion marker per `region::key` with a computation in flight. The
//! first caller to register a marker computes; everyone else blocks on the
//! marker with a bounded wait. Markers are signalled only after the value has
//! been written, so a woken waiter's lookup sees it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use tracing::{debug, error, warn};

use crate::cache::error::CacheError;
use crate::cache::keys::QualifiedKey;
use crate::cache::lock::{condvar_wait_while, mutex_lock};

const SOURCE: &str = "cache::guard::lock_table";
const STRATEGY: &str = "lock_table";

struct Marker {
    owner: ThreadId,
    done: Mutex<bool>,
    signal: Condvar,
}

impl Marker {
    fn new() -> Self {
        Self {
            owner: thread::current().id(),
            done: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn complete(&self) {
        *mutex_lock(&self.done, SOURCE, "complete") = true;
        self.signal.notify_all();
    }

    /// Returns true if the marker completed within `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = mutex_lock(&self.done, SOURCE, "wait");
        let guard = condvar_wait_while(&self.signal, guard, timeout, |done| !*done, SOURCE, "wait");
        *guard
    }
}

enum Registration {
    Owner(Arc<Marker>),
    Waiter(Arc<Marker>),
}

/// Signals the marker and unregisters it on every exit path, panics included.
struct MarkerRelease<'a> {
    markers: &'a DashMap<String, Arc<Marker>>,
    qualified: &'a str,
    marker: Arc<Marker>,
}

impl Drop for MarkerRelease<'_> {
    fn drop(&mut self) {
        self.marker.complete();
        self.markers
            .remove_if(self.qualified, |_, registered| Arc::ptr_eq(registered, &self.marker));
    }
}

/// Stampede guard backed by a table of named completion markers.
pub struct LockTableGuard {
    markers: DashMap<String, Arc<Marker>>,
    timeout: Duration,
}

impl LockTableGuard {
    /// Create a guard whose waiters give up after two `timeout` periods.
    pub fn new(timeout: Duration) -> Self {
        Self {
            markers: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.markers.len()
    }

    /// Serve `lookup` if it hits, otherwise compute with `factory` exactly once
    /// across concurrent callers and hand the result to `commit`.
    ///
    /// `commit` runs before waiters are released.
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
        if let Some(value) = lookup()? {
            return Ok(value);
        }

        let qualified = key.qualified();
        let marker = loop {
            match self.register(&qualified) {
                Registration::Owner(marker) => break marker,
                Registration::Waiter(marker) => {
                    if marker.owner == thread::current().id() {
                        warn!(
                            key = %key.key,
                            region = %key.region,
                            strategy = STRATEGY,
                            "Reentrant cache computation detected"
                        );
                        counter!("regioncache_reentrant_total", "strategy" => STRATEGY)
                            .increment(1);
                        return Err(CacheError::reentrant(&key.key, &key.region));
                    }

                    counter!("regioncache_wait_total", "strategy" => STRATEGY).increment(1);
                    self.await_completion(key, &marker)?;
                    if let Some(value) = lookup()? {
                        return Ok(value);
                    }

                    // The computation produced nothing to serve; compete again.
                    debug!(
                        key = %key.key,
                        region = %key.region,
                        "Signalled without a cached value; retrying registration"
                    );
                    thread::yield_now();
                }
            }
        };

        let _release = MarkerRelease {
            markers: &self.markers,
            qualified: &qualified,
            marker,
        };

        if let Some(value) = lookup()? {
            return Ok(value);
        }

        counter!("regioncache_compute_total", "strategy" => STRATEGY).increment(1);
        let value = factory().map_err(CacheError::factory)?;
        commit(&value);
        Ok(value)
    }

    fn register(&self, qualified: &str) -> Registration {
        match self.markers.entry(qualified.to_string()) {
            Entry::Occupied(entry) => Registration::Waiter(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let marker = Arc::new(Marker::new());
                entry.insert(Arc::clone(&marker));
                Registration::Owner(marker)
            }
        }
    }

    fn await_completion(&self, key: &QualifiedKey, marker: &Marker) -> Result<(), CacheError> {
        if marker.wait(self.timeout) {
            return Ok(());
        }

        warn!(
            key = %key.key,
            region = %key.region,
            timeout_ms = self.timeout.as_millis() as u64,
            "Cache computation exceeded wait timeout; waiting one more period"
        );
        if marker.wait(self.timeout) {
            return Ok(());
        }

        let waited = self.timeout * 2;
        error!(
            key = %key.key,
            region = %key.region,
            waited_ms = waited.as_millis() as u64,
            "Cache computation stalled"
        );
        counter!("regioncache_stalled_total").increment(1);
        Err(CacheError::stalled(&key.key, &key.region, waited))
    }
}
