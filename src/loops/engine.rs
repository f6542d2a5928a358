//! Type-erased view of a loop.
//!
//! The instructor keeps loops with different round parameters in one
//! registry and hands them to its posts through this trait.

use crate::domain::LoopState;
use crate::id::LoopId;
use crate::loops::tick_loop::{Loop, LoopPost};

pub trait Engine: Send + Sync {
    fn id(&self) -> LoopId;

    /// Set the state and wake the loop if it sleeps.
    fn notify(&self, state: LoopState);

    fn state(&self) -> LoopState;

    /// True while some thread runs the loop.
    fn is_alive(&self) -> bool;

    /// True if the calling thread runs the loop.
    fn is_current(&self) -> bool;

    /// Queue a post for the loop's own thread.
    fn post_boxed(&self, action: LoopPost);
}

impl<P: 'static> Engine for Loop<P> {
    fn id(&self) -> LoopId {
        Loop::id(self)
    }

    fn notify(&self, state: LoopState) {
        Loop::notify(self, state)
    }

    fn state(&self) -> LoopState {
        Loop::state(self)
    }

    fn is_alive(&self) -> bool {
        Loop::is_alive(self)
    }

    fn is_current(&self) -> bool {
        Loop::is_current(self)
    }

    fn post_boxed(&self, action: LoopPost) {
        Loop::post(self, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Retain;
    use crate::loops::variants::Once;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_engine_view_matches_loop() {
        let lp: Loop = Loop::new(Once);
        let engine: &dyn Engine = &lp;
        assert_eq!(engine.id(), lp.id());
        assert!(!engine.is_alive());
        assert!(!engine.is_current());

        engine.notify(LoopState::Sleep);
        assert_eq!(lp.state(), LoopState::Sleep);
    }

    #[test]
    fn test_post_boxed_reaches_loop_thread() {
        let lp: Loop = Loop::new(Once);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let engine: Arc<dyn Engine> = Arc::new(lp.clone());
        engine.post_boxed(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Retain::Drop
        }));
        lp.start().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
