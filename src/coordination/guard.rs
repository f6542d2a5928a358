//! Poison-tolerant wrappers over std mutexes and condition variables.
//!
//! The crate's bookkeeping guards (queues, registry, state, owner) are never
//! held while a user callback runs. The one exception is the per-call cell
//! that shares a timed instructor post between the queue and its timer: the
//! side that wins the race holds that cell while the post runs, and nothing
//! else ever contends for it. A poisoned mutex therefore means a panic
//! unwound through a user post or through the crate itself, and the data
//! behind it is still consistent, so it is recovered.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait_while<'a, T, F>(condvar: &Condvar, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    condvar
        .wait_while(guard, condition)
        .unwrap_or_else(PoisonError::into_inner)
}

/// Returns the guard and whether the wait timed out with `condition` still true.
pub(crate) fn wait_timeout_while<'a, T, F>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    condition: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut(&mut T) -> bool,
{
    let (guard, result) = condvar
        .wait_timeout_while(guard, timeout, condition)
        .unwrap_or_else(PoisonError::into_inner);
    (guard, result.timed_out())
}
