//! Lock-free stampede guard.
//!
//! A fixed array of slots, each holding `0` or the token of the thread
//! computing for whichever key currently hashes there. A slot is a proxy
//! mutex shared by many keys, never a binding to one key. Contenders spin on
//! the cache for a short budget and then compute without caching.
//!
//! A key always maps to the same slot, whatever the nesting depth, so every
//! thread contending for it meets on one owner.
//!
//! A per-thread set of in-flight key hashes catches a factory that asks for
//! its own key again; the nested call computes directly instead of spinning
//! on a slot its own thread holds.

use std::cell::RefCell;
use std::collections::HashSet;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::debug;

use crate::cache::error::CacheError;
use crate::cache::keys::QualifiedKey;

const STRATEGY: &str = "lock_free";
const FREE: u64 = 0;

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
    // (guard id, key hash) pairs this thread is computing.
    static IN_FLIGHT: RefCell<HashSet<(u64, u64)>> = RefCell::new(HashSet::new());
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Membership in the current thread's in-flight set, removed on drop.
struct ReentrancyEntry {
    marker: (u64, u64),
}

impl ReentrancyEntry {
    /// Returns `None` when this thread is already computing the key.
    fn enter(guard_id: u64, hash: u64) -> Option<Self> {
        IN_FLIGHT.with(|in_flight| {
            in_flight
                .borrow_mut()
                .insert((guard_id, hash))
                .then_some(Self {
                    marker: (guard_id, hash),
                })
        })
    }
}

impl Drop for ReentrancyEntry {
    fn drop(&mut self) {
        let _ = IN_FLIGHT.try_with(|in_flight| {
            in_flight.borrow_mut().remove(&self.marker);
        });
    }
}

/// Resets a slot this call claimed, unless another thread owns it by now.
struct SlotRelease<'a> {
    slot: &'a AtomicU64,
    owner: u64,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        let _ = self
            .slot
            .compare_exchange(self.owner, FREE, Ordering::AcqRel, Ordering::Relaxed);
    }
}

/// Stampede guard backed by a hashed array of ownership slots.
pub struct LockFreeGuard {
    id: u64,
    slots: Box<[AtomicU64]>,
    spin_timeout: Duration,
}

impl LockFreeGuard {
    /// Create a guard with `table_size` slots (at least one).
    pub fn new(table_size: usize, spin_timeout: Duration) -> Self {
        let slots = (0..table_size.max(1)).map(|_| AtomicU64::new(FREE)).collect();
        Self {
            id: NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed),
            slots,
            spin_timeout,
        }
    }

    pub fn table_size(&self) -> usize {
        self.slots.len()
    }

    pub fn spin_timeout(&self) -> Duration {
        self.spin_timeout
    }

    /// Number of slots currently owned by some thread.
    pub fn busy_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != FREE)
            .count()
    }

    /// Serve `lookup` if it hits, otherwise compute with `factory`.
    ///
    /// Only the slot owner hands its value to `commit`. A nested request for a
    /// key already being computed on this thread, and a contender whose spin
    /// budget runs out, both return the factory's value without committing it.
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

        let hash = key.hash_code();
        let Some(_entry) = ReentrancyEntry::enter(self.id, hash) else {
            debug!(
                key = %key.key,
                region = %key.region,
                strategy = STRATEGY,
                "Reentrant cache computation; computing directly"
            );
            counter!("regioncache_reentrant_total", "strategy" => STRATEGY).increment(1);
            return factory().map_err(CacheError::factory);
        };

        let slot = &self.slots[self.slot_index(hash)];
        let me = thread_token();
        let started = Instant::now();

        loop {
            match slot.compare_exchange(FREE, me, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    let _release = SlotRelease { slot, owner: me };
                    return Self::compute_owned(&lookup, factory, commit);
                }
                // Claimed by an outer call on this thread; that call releases it.
                Err(owner) if owner == me => {
                    return Self::compute_owned(&lookup, factory, commit);
                }
                Err(_) => {
                    if let Some(value) = lookup()? {
                        return Ok(value);
                    }
                    if started.elapsed() >= self.spin_timeout {
                        debug!(
                            key = %key.key,
                            region = %key.region,
                            spin_ms = self.spin_timeout.as_millis() as u64,
                            "Slot still owned after spin budget; computing uncached"
                        );
                        counter!("regioncache_uncached_fallback_total").increment(1);
                        return factory().map_err(CacheError::factory);
                    }
                    hint::spin_loop();
                    thread::yield_now();
                }
            }
        }
    }

    fn compute_owned<T, E, L, F, C>(lookup: &L, factory: F, commit: C) -> Result<T, CacheError>
    where
        L: Fn() -> Result<Option<T>, CacheError>,
        F: FnOnce() -> Result<T, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        C: FnOnce(&T),
    {
        // Another owner may have stored and released an instant ago.
        if let Some(value) = lookup()? {
            return Ok(value);
        }

        counter!("regioncache_compute_total", "strategy" => STRATEGY).increment(1);
        let value = factory().map_err(CacheError::factory)?;
        commit(&value);
        Ok(value)
    }

    fn slot_index(&self, hash: u64) -> usize {
        (hash % self.slots.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier, Mutex, mpsc};

    use super::*;

    type Cell = Arc<Mutex<Option<u64>>>;

    fn lookup(cell: &Cell) -> impl Fn() -> Result<Option<u64>, CacheError> + '_ {
        move || Ok(*cell.lock().expect("cell lock"))
    }

    fn commit(cell: &Cell) -> impl FnOnce(&u64) + '_ {
        move |value| *cell.lock().expect("cell lock") = Some(*value)
    }

    fn key() -> QualifiedKey {
        QualifiedKey::new("X", "EntityModel")
    }

    #[test]
    fn concurrent_callers_compute_once() {
        // Generous spin budget so no contender falls back during the test.
        let guard = Arc::new(LockFreeGuard::new(4099, Duration::from_secs(5)));
        let cell: Cell = Arc::new(Mutex::new(None));
        let computations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let cell = Arc::clone(&cell);
                let computations = Arc::clone(&computations);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    guard.get_or_compute(
                        &key(),
                        lookup(&cell),
                        || {
                            let n = computations.fetch_add(1, Ordering::SeqCst) as u64;
                            thread::sleep(Duration::from_millis(50));
                            Ok::<_, Infallible>(100 + n)
                        },
                        commit(&cell),
                    )
                })
            })
            .collect();

        let values: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().expect("worker").expect("value"))
            .collect();

        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| *v == 100));
        assert_eq!(guard.busy_slots(), 0);
    }

    #[test]
    fn reentrant_request_computes_directly() {
        let guard = LockFreeGuard::new(101, Duration::from_millis(10));
        let cell: Cell = Arc::new(Mutex::new(None));

        let outer = guard.get_or_compute(
            &key(),
            lookup(&cell),
            || {
                let inner = guard
                    .get_or_compute(
                        &key(),
                        lookup(&cell),
                        || Ok::<_, Infallible>(7),
                        commit(&cell),
                    )
                    .expect("inner value");
                assert_eq!(inner, 7);
                // The nested value is not committed.
                assert!(cell.lock().expect("cell").is_none());
                Ok::<_, Infallible>(inner + 1)
            },
            commit(&cell),
        );

        assert_eq!(outer.expect("outer value"), 8);
        assert_eq!(*cell.lock().expect("cell"), Some(8));
        assert_eq!(guard.busy_slots(), 0);
    }

    #[test]
    fn nested_distinct_key_sharing_slot_keeps_outer_ownership() {
        // A single slot forces every key onto it.
        let guard = LockFreeGuard::new(1, Duration::from_millis(10));
        let outer_cell: Cell = Arc::new(Mutex::new(None));
        let inner_cell: Cell = Arc::new(Mutex::new(None));
        let inner_key = QualifiedKey::new("Y", "EntityModel");

        let outer = guard.get_or_compute(
            &key(),
            lookup(&outer_cell),
            || {
                let inner = guard
                    .get_or_compute(
                        &inner_key,
                        lookup(&inner_cell),
                        || Ok::<_, Infallible>(2),
                        commit(&inner_cell),
                    )
                    .expect("inner value");
                assert_eq!(guard.busy_slots(), 1, "outer still owns the slot");
                Ok::<_, Infallible>(inner * 10)
            },
            commit(&outer_cell),
        );

        assert_eq!(outer.expect("outer value"), 20);
        assert_eq!(*inner_cell.lock().expect("cell"), Some(2));
        assert_eq!(guard.busy_slots(), 0);
    }

    #[test]
    fn nested_request_waits_for_other_threads_owner() {
        let guard = Arc::new(LockFreeGuard::new(4099, Duration::from_secs(5)));
        let x_cell: Cell = Arc::new(Mutex::new(None));
        let y_cell: Cell = Arc::new(Mutex::new(None));
        let x_computations = Arc::new(AtomicUsize::new(0));
        // An outer key on its own slot, so the nested request for X runs one level deep.
        let outer_key = (0..)
            .map(|n| QualifiedKey::new(format!("Y-{n}"), "EntityModel"))
            .find(|candidate| {
                guard.slot_index(candidate.hash_code()) != guard.slot_index(key().hash_code())
            })
            .expect("a key on another slot");

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let owner = {
            let guard = Arc::clone(&guard);
            let x_cell = Arc::clone(&x_cell);
            let x_computations = Arc::clone(&x_computations);
            thread::spawn(move || {
                guard.get_or_compute(
                    &key(),
                    lookup(&x_cell),
                    || {
                        x_computations.fetch_add(1, Ordering::SeqCst);
                        started_tx.send(()).expect("signal start");
                        let _ = release_rx.recv();
                        Ok::<_, Infallible>(1)
                    },
                    commit(&x_cell),
                )
            })
        };
        started_rx.recv().expect("owner started");

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release_tx.send(());
        });

        let outer = guard.get_or_compute(
            &outer_key,
            lookup(&y_cell),
            || {
                let inner = guard
                    .get_or_compute(
                        &key(),
                        lookup(&x_cell),
                        || {
                            x_computations.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, Infallible>(2)
                        },
                        commit(&x_cell),
                    )
                    .expect("inner value");
                Ok::<_, Infallible>(inner * 10)
            },
            commit(&y_cell),
        );

        releaser.join().expect("releaser");
        assert_eq!(owner.join().expect("owner").expect("owner value"), 1);
        assert_eq!(outer.expect("outer value"), 10);
        assert_eq!(x_computations.load(Ordering::SeqCst), 1);
        assert_eq!(*x_cell.lock().expect("cell"), Some(1));
    }

    #[test]
    fn waiter_observes_owner_commit() {
        let guard = Arc::new(LockFreeGuard::new(101, Duration::from_secs(5)));
        let cell: Cell = Arc::new(Mutex::new(None));
        let (started_tx, started_rx) = mpsc::channel();

        let owner = {
            let guard = Arc::clone(&guard);
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                guard.get_or_compute(
                    &key(),
                    lookup(&cell),
                    || {
                        started_tx.send(()).expect("signal start");
                        thread::sleep(Duration::from_millis(50));
                        Ok::<_, Infallible>(9)
                    },
                    commit(&cell),
                )
            })
        };

        started_rx.recv().expect("owner started");
        let waited = guard
            .get_or_compute(
                &key(),
                lookup(&cell),
                || -> Result<u64, Infallible> { panic!("waiter must not compute") },
                |_: &u64| panic!("waiter must not commit"),
            )
            .expect("waiter value");

        assert_eq!(waited, 9);
        assert_eq!(owner.join().expect("owner").expect("owner value"), 9);
        assert_eq!(guard.busy_slots(), 0);
    }

    #[test]
    fn spin_timeout_falls_back_to_uncached_value() {
        let guard = Arc::new(LockFreeGuard::new(101, Duration::from_millis(10)));
        let cell: Cell = Arc::new(Mutex::new(None));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let owner = {
            let guard = Arc::clone(&guard);
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                guard.get_or_compute(
                    &key(),
                    lookup(&cell),
                    || {
                        started_tx.send(()).expect("signal start");
                        let _ = release_rx.recv();
                        Ok::<_, Infallible>(1)
                    },
                    commit(&cell),
                )
            })
        };

        started_rx.recv().expect("owner started");
        let fallback_commits = Arc::new(AtomicUsize::new(0));
        let value = guard
            .get_or_compute(
                &key(),
                lookup(&cell),
                || Ok::<_, Infallible>(2),
                |_: &u64| {
                    fallback_commits.fetch_add(1, Ordering::SeqCst);
                },
            )
            .expect("fallback value");
        assert_eq!(value, 2);
        assert_eq!(fallback_commits.load(Ordering::SeqCst), 0);

        release_tx.send(()).expect("release owner");
        assert_eq!(owner.join().expect("owner").expect("owner value"), 1);
        assert_eq!(*cell.lock().expect("cell"), Some(1));
    }

    #[test]
    fn panicking_factory_releases_slot_and_marker() {
        let guard = LockFreeGuard::new(101, Duration::from_millis(10));
        let cell: Cell = Arc::new(Mutex::new(None));

        let result = catch_unwind(AssertUnwindSafe(|| {
            guard.get_or_compute(
                &key(),
                lookup(&cell),
                || -> Result<u64, Infallible> { panic!("factory panicked") },
                commit(&cell),
            )
        }));
        assert!(result.is_err());
        assert_eq!(guard.busy_slots(), 0);

        // The reentrancy marker was cleared, so this is a normal computation.
        let value = guard
            .get_or_compute(
                &key(),
                lookup(&cell),
                || Ok::<_, Infallible>(3),
                commit(&cell),
            )
            .expect("value");
        assert_eq!(value, 3);
        assert_eq!(*cell.lock().expect("cell"), Some(3));
    }

    #[test]
    fn separate_guards_do_not_share_reentrancy_state() {
        let first = LockFreeGuard::new(101, Duration::from_millis(10));
        let second = LockFreeGuard::new(101, Duration::from_millis(10));
        let cell: Cell = Arc::new(Mutex::new(None));
        let other: Cell = Arc::new(Mutex::new(None));

        first
            .get_or_compute(
                &key(),
                lookup(&cell),
                || {
                    second
                        .get_or_compute(
                            &key(),
                            lookup(&other),
                            || Ok::<_, Infallible>(4),
                            commit(&other),
                        )
                        .expect("second guard value");
                    Ok::<_, Infallible>(5)
                },
                commit(&cell),
            )
            .expect("first guard value");

        assert_eq!(*other.lock().expect("cell"), Some(4));
        assert_eq!(*cell.lock().expect("cell"), Some(5));
    }

    #[test]
    fn slot_index_depends_only_on_key() {
        let guard = LockFreeGuard::new(4099, Duration::from_millis(10));
        let hash = key().hash_code();
        assert_eq!(guard.slot_index(hash), guard.slot_index(hash));
        assert_eq!(guard.slot_index(hash), (hash % 4099) as usize);
        assert!(guard.slot_index(u64::MAX) < guard.table_size());
    }
}
