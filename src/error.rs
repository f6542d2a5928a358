//! Error types for tickloop
//!
//! Centralized error handling using thiserror. Every variant is a contract
//! violation reported synchronously to the caller that made it.

use thiserror::Error;

use crate::id::LoopId;

/// All error types that can occur in tickloop
#[derive(Debug, Error)]
pub enum TickloopError {
    /// `start` on a loop that some thread already owns
    #[error("Loop {0} is already running")]
    AlreadyOwned(LoopId),

    /// Blocking call from the thread that would have to service it
    #[error("Re-entrant call would deadlock: {0}")]
    Reentrant(String),

    /// Timeouts must be zero or positive
    #[error("Negative timeout: {0}ms")]
    NegativeTimeout(i64),

    /// Caller does not own the loop it named
    #[error("Current thread does not own loop {0}")]
    NotOwner(LoopId),

    /// Loop was not started through this instructor
    #[error("Loop {0} is not registered with this instructor")]
    NotRegistered(LoopId),

    /// Lock operation from a thread other than the one that created the lock
    #[error("Lock can only be used by its master thread")]
    NotMaster,

    /// Lock was closed and cannot be locked again
    #[error("Lock is closed")]
    LockClosed,

    /// Holder protocol entered from a foreign thread
    #[error("Lock holder protocol run outside the holder thread")]
    NotHolder,

    /// IO error (thread spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tickloop operations
pub type Result<T> = std::result::Result<T, TickloopError>;

/// Reject negative millisecond timeouts.
pub(crate) fn check_timeout(millis: i64) -> Result<std::time::Duration> {
    if millis < 0 {
        return Err(TickloopError::NegativeTimeout(millis));
    }
    Ok(std::time::Duration::from_millis(millis as u64))
}
