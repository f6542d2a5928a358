//! Single-flight rendezvous cell.
//!
//! Every race in tickloop (a post against its alternate, an action against a
//! timer, a blocked caller against its fallback) is settled through one of
//! these. Contenders call [`Rendezvous::claim`]; exactly one of them gets
//! `true` and must later call [`Rendezvous::finish`]. Waiters park on the
//! cell until it is finished.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::coordination::guard::{lock, wait_timeout_while, wait_while};
use crate::domain::Resolved;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Claimed,
    Done(Resolved),
}

/// One-shot flag guarded by its own mutex.
#[derive(Debug)]
pub struct Rendezvous {
    phase: Mutex<Phase>,
    changed: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Pending),
            changed: Condvar::new(),
        }
    }

    /// Try to win the race. Returns true for exactly one caller.
    pub fn claim(&self) -> bool {
        let mut phase = lock(&self.phase);
        if *phase != Phase::Pending {
            return false;
        }
        *phase = Phase::Claimed;
        self.changed.notify_all();
        true
    }

    /// Record which side ran and release every waiter.
    ///
    /// Only the winner of [`claim`](Self::claim) calls this.
    pub fn finish(&self, resolved: Resolved) {
        let mut phase = lock(&self.phase);
        *phase = Phase::Done(resolved);
        self.changed.notify_all();
    }

    /// True once someone has claimed the cell.
    pub fn is_settled(&self) -> bool {
        *lock(&self.phase) != Phase::Pending
    }

    /// The winning side, if the winner has finished.
    pub fn resolution(&self) -> Option<Resolved> {
        match *lock(&self.phase) {
            Phase::Done(resolved) => Some(resolved),
            _ => None,
        }
    }

    /// Block until the winner has finished.
    pub fn wait(&self) -> Resolved {
        let mut phase = lock(&self.phase);
        loop {
            if let Phase::Done(resolved) = *phase {
                return resolved;
            }
            phase = wait_while(&self.changed, phase, |phase| !matches!(phase, Phase::Done(_)));
        }
    }

    /// Block until somebody claims the cell or `timeout` passes.
    ///
    /// Returns true if the cell was claimed in time.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let (_phase, timed_out) = wait_timeout_while(&self.changed, lock(&self.phase), timeout, |phase| {
            *phase == Phase::Pending
        });
        !timed_out
    }
}

/// Finishes a claimed rendezvous when dropped, including during a panic,
/// so waiters are never left parked behind a callback that unwound.
pub(crate) struct Finish<'a> {
    rendezvous: &'a Rendezvous,
    resolved: Resolved,
}

impl Rendezvous {
    /// Finish with `resolved` once the returned guard goes out of scope.
    pub(crate) fn finish_on_drop(&self, resolved: Resolved) -> Finish<'_> {
        Finish {
            rendezvous: self,
            resolved,
        }
    }
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        self.rendezvous.finish(self.resolved);
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}
