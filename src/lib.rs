//! Tickloop - thread-bound cooperative loops and cross-thread coordination
//!
//! A [`Loop`] runs an ordered list of steps on whichever OS thread starts it,
//! services posts queued by other threads between steps, and obeys a
//! CONTINUE / BREAK / SLEEP control state. An [`Instructor`] coordinates many
//! loops through a shared default state and a post queue of its own, and
//! [`Lock`] holds a mutex across calls that do not share a scope.

pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod id;
pub mod loops;
pub mod manager;

pub use config::Config;
pub use coordination::{Lock, Rendezvous};
pub use domain::{Flow, LoopState, Resolved, Retain};
pub use error::{Result, TickloopError};
pub use id::LoopId;
pub use loops::{Do, Driver, Engine, For, Foreach, Forever, Loop, LoopPost, Once, Step, While};
pub use manager::{Instructor, InstructorPost};
