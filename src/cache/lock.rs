//! Poison-recovering wrappers around the std lock primitives used by the cache.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::warn;

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

/// Block on `condvar` while `condition` holds, for at most `timeout`.
///
/// Returns the reacquired guard; the caller re-reads the protected state to
/// learn whether the wait ended by notification or by timeout.
pub(crate) fn condvar_wait_while<'a, T, F>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    condition: F,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    match condvar.wait_timeout_while(guard, timeout, condition) {
        Ok((guard, _)) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "condvar.wait",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner().0
        }
    }
}
