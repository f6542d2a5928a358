//! Loops - thread-bound cooperative execution engines.
//!
//! - `Loop`: steps, posts, control state and single-thread ownership
//! - `Driver`: iteration policy, with the built-in Once, Forever, While,
//!   For and Foreach
//! - `Engine`: type-erased loop view used by the instructor

pub mod engine;
pub mod tick_loop;
pub mod variants;

pub use engine::Engine;
pub use tick_loop::{Loop, LoopPost, Step};
pub use variants::{Do, Driver, For, Foreach, Forever, Once, While};
