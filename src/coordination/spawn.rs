//! Named OS thread spawning.

use std::thread::{self, JoinHandle};

use crate::config::ThreadConfig;
use crate::error::Result;
use crate::id::generate_thread_name;

/// Spawn a thread named `{prefix}-{role}-{seq}` with the configured stack size.
pub(crate) fn spawn<F, R>(config: &ThreadConfig, role: &str, f: F) -> Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let name = generate_thread_name(&config.name_prefix, role);
    let mut builder = thread::Builder::new().name(name);
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }
    Ok(builder.spawn(f)?)
}
