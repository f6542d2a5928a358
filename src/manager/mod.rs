//! Manager module
//!
//! Coordinates many loops through one instructor.

mod instructor;

pub use instructor::{Instructor, InstructorPost};
