//! Iteration policies for loops.
//!
//! A [`Driver`] decides how many rounds a run has and what parameter each
//! round hands to the steps. Every driver stops as soon as a round reports
//! [`Flow::Stop`].

use crate::domain::Flow;
use crate::loops::tick_loop::Loop;

/// Drives a loop's rounds from the owning thread.
pub trait Driver<P>: Send + Sync {
    /// Called once per run, on the thread that started the loop.
    fn drive(&self, lp: &Loop<P>);
}

/// One round, whatever the state afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct Once;

/// Alias for [`Once`].
pub type Do = Once;

impl<P: 'static> Driver<P> for Once {
    fn drive(&self, lp: &Loop<P>) {
        lp.next(None);
    }
}

/// Rounds until the loop is told to break.
#[derive(Debug, Clone, Copy, Default)]
pub struct Forever;

impl<P: 'static> Driver<P> for Forever {
    fn drive(&self, lp: &Loop<P>) {
        while lp.next(None) == Flow::Proceed {}
    }
}

/// Rounds while `condition` holds, checked before each round.
pub struct While<C> {
    condition: C,
}

impl<C> While<C>
where
    C: Fn() -> bool + Send + Sync,
{
    pub fn new(condition: C) -> Self {
        Self { condition }
    }
}

impl<P: 'static, C> Driver<P> for While<C>
where
    C: Fn() -> bool + Send + Sync,
{
    fn drive(&self, lp: &Loop<P>) {
        while (self.condition)() {
            if lp.next(None).is_stop() {
                break;
            }
        }
    }
}

/// Counted rounds over a cursor.
///
/// Each run starts from a clone of `initial`. Before each round
/// `condition(&cursor)` must hold; the cursor advances through `reducer` only
/// after a round that completed without stopping.
pub struct For<P, C, R> {
    initial: P,
    condition: C,
    reducer: R,
}

impl<P, C, R> For<P, C, R>
where
    P: Clone + Send + Sync,
    C: Fn(&P) -> bool + Send + Sync,
    R: Fn(P) -> P + Send + Sync,
{
    pub fn new(initial: P, condition: C, reducer: R) -> Self {
        Self {
            initial,
            condition,
            reducer,
        }
    }
}

impl<P, C, R> Driver<P> for For<P, C, R>
where
    P: Clone + Send + Sync + 'static,
    C: Fn(&P) -> bool + Send + Sync,
    R: Fn(P) -> P + Send + Sync,
{
    fn drive(&self, lp: &Loop<P>) {
        let mut cursor = self.initial.clone();
        while (self.condition)(&cursor) {
            if lp.next(Some(&cursor)).is_stop() {
                break;
            }
            cursor = (self.reducer)(cursor);
        }
    }
}

type Source<T> = Box<dyn Fn() -> Box<dyn Iterator<Item = T>> + Send + Sync>;

/// One round per item of a finite source.
///
/// The source is re-iterated from the start on every run.
pub struct Foreach<T> {
    source: Source<T>,
}

impl<T: 'static> Foreach<T> {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: 'static,
    {
        Self {
            source: Box::new(move || Box::new(items.clone().into_iter())),
        }
    }
}

impl<T: 'static> Driver<T> for Foreach<T> {
    fn drive(&self, lp: &Loop<T>) {
        for item in (self.source)() {
            if lp.next(Some(&item)).is_stop() {
                break;
            }
        }
    }
}

impl Loop<()> {
    /// A loop that runs its steps once.
    pub fn once() -> Self {
        Loop::new(Once)
    }

    /// A loop that runs until told to break.
    pub fn forever() -> Self {
        Loop::new(Forever)
    }

    /// A loop that runs while `condition` holds.
    pub fn repeat_while<C>(condition: C) -> Self
    where
        C: Fn() -> bool + Send + Sync + 'static,
    {
        Loop::new(While::new(condition))
    }
}

impl<P: Clone + Send + Sync + 'static> Loop<P> {
    /// A loop counting a cursor from `initial` while `condition` holds.
    pub fn counting<C, R>(initial: P, condition: C, reducer: R) -> Self
    where
        C: Fn(&P) -> bool + Send + Sync + 'static,
        R: Fn(P) -> P + Send + Sync + 'static,
    {
        Loop::new(For::new(initial, condition, reducer))
    }

    /// A loop with one round per item.
    pub fn foreach<I>(items: I) -> Self
    where
        I: IntoIterator<Item = P> + Clone + Send + Sync + 'static,
        I::IntoIter: 'static,
    {
        Loop::new(Foreach::new(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LoopState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn recorder<P: Clone + Send + 'static>(lp: &Loop<P>) -> Arc<Mutex<Vec<P>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        lp.append(move |_, param| {
            if let Some(param) = param {
                sink.lock().unwrap().push(param.clone());
            }
        });
        seen
    }

    #[test]
    fn test_once_ignores_continue() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let lp = Loop::once();
        let counter = rounds.clone();
        lp.append(move |_, param| {
            assert!(param.is_none());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        lp.start().unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_do_alias() {
        let lp: Loop = Loop::new(Do::default());
        lp.start().unwrap();
    }

    #[test]
    fn test_forever_stops_on_break() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let lp = Loop::forever();
        let counter = rounds.clone();
        lp.append(move |lp, _| {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
                lp.notify(LoopState::Break);
            }
        });
        lp.start().unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_while_checks_condition_before_each_round() {
        let budget = Arc::new(AtomicUsize::new(4));
        let rounds = Arc::new(AtomicUsize::new(0));
        let remaining = budget.clone();
        let lp = Loop::repeat_while(move || remaining.load(Ordering::SeqCst) > 0);
        let (budget_step, counter) = (budget.clone(), rounds.clone());
        lp.append(move |_, _| {
            budget_step.fetch_sub(1, Ordering::SeqCst);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        lp.start().unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_while_false_runs_no_round() {
        let lp = Loop::repeat_while(|| false);
        lp.append(|_, _| panic!("must not run"));
        lp.start().unwrap();
    }

    #[test]
    fn test_for_passes_cursor() {
        let lp = Loop::counting(0, |i| *i < 5, |i| i + 1);
        let seen = recorder(&lp);
        lp.start().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_for_restarts_from_initial() {
        let lp = Loop::counting(10, |i| *i < 13, |i| i + 1);
        let seen = recorder(&lp);
        lp.start().unwrap();
        lp.start().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![10, 11, 12, 10, 11, 12]);
    }

    #[test]
    fn test_for_does_not_advance_after_stop() {
        let lp = Loop::counting(0u32, |_| true, |i| i + 1);
        let seen = recorder(&lp);
        lp.append(|lp, cursor| {
            if cursor == Some(&2) {
                lp.notify(LoopState::Break);
            }
        });
        lp.start().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_foreach_stops_on_break() {
        let lp = Loop::foreach(vec![1, 2, 3, 4, 5]);
        let seen = recorder(&lp);
        lp.append(|lp, item| {
            if item == Some(&3) {
                lp.notify(LoopState::Break);
            }
        });
        lp.start().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_foreach_exhausts_source() {
        let lp = Loop::foreach(["a", "b"]);
        let seen = recorder(&lp);
        lp.start().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_foreach_over_range() {
        let lp = Loop::foreach(0..3);
        let seen = recorder(&lp);
        lp.start().unwrap();
        lp.start().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    }
}
