//! ID generation utilities for tickloop
//!
//! Provides process-wide sequences for loop identities, post tickets and
//! spawned thread names.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static LOOP_SEQ: AtomicU64 = AtomicU64::new(1);
static TICKET_SEQ: AtomicU64 = AtomicU64::new(1);
static THREAD_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a loop, stable across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u64);

impl LoopId {
    /// Wrap a raw value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw sequence number
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// Generate a unique loop ID
pub fn generate_loop_id() -> LoopId {
    LoopId(LOOP_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Generate a ticket identifying one queued instructor post
pub fn generate_ticket() -> u64 {
    TICKET_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Generate a thread name
///
/// Format: `{prefix}-{role}-{seq}`
/// Example: `tickloop-timer-12`
pub fn generate_thread_name(prefix: &str, role: &str) -> String {
    let seq = THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, role, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_loop_id_uniqueness() {
        let id1 = generate_loop_id();
        let id2 = generate_loop_id();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn test_loop_id_display() {
        assert_eq!(LoopId::from_raw(42).to_string(), "loop-42");
        assert_eq!(LoopId::from_raw(42).as_u64(), 42);
    }

    #[test]
    fn test_generate_ticket_increases() {
        let a = generate_ticket();
        let b = generate_ticket();
        assert!(b > a);
    }

    #[test]
    fn test_generate_thread_name_format() {
        let name = generate_thread_name("tickloop", "timer");
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "tickloop");
        assert_eq!(parts[1], "timer");
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }
}
