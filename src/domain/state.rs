//! Loop control state
//!
//! A loop's state decides what the next tick does: proceed to the next step,
//! stop the run, or suspend until someone notifies a different state.

use serde::{Deserialize, Serialize};

/// Control value shared between a loop and the threads that steer it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    /// Keep running steps
    #[default]
    Continue,
    /// End the current run (the loop can be started again)
    Break,
    /// Suspend before the next step until notified
    Sleep,
}

impl LoopState {
    /// Returns true if this state ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Break)
    }

    /// Returns true if this state suspends a run
    pub fn is_suspended(&self) -> bool {
        matches!(self, LoopState::Sleep)
    }
}

/// Verdict of a tick or a round of steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Carry on with the next step or round
    Proceed,
    /// The loop was told to break
    Stop,
}

impl Flow {
    pub fn is_stop(&self) -> bool {
        matches!(self, Flow::Stop)
    }
}
