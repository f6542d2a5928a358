//! Domain types for tickloop
//!
//! - LoopState: CONTINUE / BREAK / SLEEP control value
//! - Flow: verdict of a tick
//! - Retain: keep/drop decision returned by posts
//! - Resolved: which side of a single-flight race ran

pub mod outcome;
pub mod state;

pub use outcome::{Resolved, Retain};
pub use state::{Flow, LoopState};
