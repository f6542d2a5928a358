//! Cross-thread coordination primitives
//!
//! Building blocks shared by loops and the instructor, plus the transferable
//! lock: guard helpers, the single-flight rendezvous cell, and named thread
//! spawning.

pub(crate) mod guard;
pub mod lock;
pub mod rendezvous;
pub(crate) mod spawn;

pub use lock::Lock;
pub use rendezvous::Rendezvous;
