//! Loop engine - a restartable, single-owner execution loop.
//!
//! A Loop owns an ordered list of steps, a FIFO queue of posts, a control
//! state and the identity of the thread currently running it. A [`Driver`]
//! decides how many rounds run; each round walks the steps and ticks before
//! every step and once after the last:
//!
//! - drain the post queue (each post says whether it stays queued)
//! - CONTINUE: proceed
//! - BREAK: stop the run
//! - SLEEP: park until notified, then tick again
//!
//! The four pieces of shared state have their own guards. When the step list
//! and the control state are needed together, the step list is locked first;
//! [`Loop::lock_code_and_state`] is the only place that takes both.
//!
//! A run ends with a final drain of the post queue, after the runner is
//! cleared and before anyone may claim the loop again. A post that panics
//! unwinds out of the drain, but the posts queued behind it stay queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crate::config::ThreadConfig;
use crate::coordination::guard::{lock, wait_timeout_while, wait_while};
use crate::coordination::rendezvous::Rendezvous;
use crate::coordination::spawn::spawn;
use crate::domain::{Flow, LoopState, Resolved, Retain};
use crate::error::{Result, TickloopError, check_timeout};
use crate::id::{LoopId, generate_loop_id};
use crate::loops::variants::Driver;

/// A step callback. Receives the running loop and the round's parameter.
pub type Step<P> = Arc<dyn Fn(&Loop<P>, Option<&P>) + Send + Sync>;

/// A queued one-shot callback run by the loop's own thread.
pub type LoopPost = Box<dyn FnMut() -> Retain + Send>;

#[derive(Debug)]
struct Control {
    state: LoopState,
    /// Bumped on every post so a sleeping tick knows to drain again.
    arrivals: u64,
}

struct Shared<P> {
    id: LoopId,
    code: Mutex<Vec<Step<P>>>,
    posts: Mutex<VecDeque<LoopPost>>,
    control: Mutex<Control>,
    wake: Condvar,
    owner: Mutex<Ownership>,
    released: Condvar,
    threads: ThreadConfig,
}

#[derive(Debug, Default)]
struct Ownership {
    /// Thread running the steps.
    runner: Option<ThreadId>,
    /// Thread performing the final drain of a run that just ended.
    finishing: Option<ThreadId>,
}

/// Handle to a loop. Clones share the same loop.
pub struct Loop<P = ()> {
    shared: Arc<Shared<P>>,
    driver: Arc<dyn Driver<P>>,
}

impl<P> Clone for Loop<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            driver: self.driver.clone(),
        }
    }
}

impl<P> fmt::Debug for Loop<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("id", &self.shared.id)
            .field("owner", &lock(&self.shared.owner).runner)
            .finish()
    }
}

/// Clears the owner when a run ends, including by panic.
struct OwnerGuard<'a, P> {
    shared: &'a Shared<P>,
}

impl<P> OwnerGuard<'_, P> {
    /// Give up the runner role but keep the loop claimed for the final drain.
    fn begin_final_drain(&self) {
        let mut owner = lock(&self.shared.owner);
        owner.runner = None;
        owner.finishing = Some(thread::current().id());
        self.shared.released.notify_all();
    }
}

impl<P> Drop for OwnerGuard<'_, P> {
    fn drop(&mut self) {
        let mut owner = lock(&self.shared.owner);
        owner.runner = None;
        owner.finishing = None;
        self.shared.released.notify_all();
    }
}

/// Posts taken off the queue for one drain. Whatever has not run yet, and
/// whatever asked to stay, goes back to the front of the queue on drop.
struct Batch<'a> {
    queue: &'a Mutex<VecDeque<LoopPost>>,
    pending: VecDeque<LoopPost>,
    kept: Vec<LoopPost>,
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.pending.is_empty() && self.kept.is_empty() {
            return;
        }
        let mut queue = lock(self.queue);
        for post in self.pending.drain(..).rev() {
            queue.push_front(post);
        }
        for post in self.kept.drain(..).rev() {
            queue.push_front(post);
        }
    }
}

impl<P: 'static> Loop<P> {
    /// Create a loop driven by `driver`.
    pub fn new<D: Driver<P> + 'static>(driver: D) -> Self {
        Self::with_threads(driver, ThreadConfig::default())
    }

    /// Create a loop whose spawned threads follow `threads`.
    pub fn with_threads<D: Driver<P> + 'static>(driver: D, threads: ThreadConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: generate_loop_id(),
                code: Mutex::new(Vec::new()),
                posts: Mutex::new(VecDeque::new()),
                control: Mutex::new(Control {
                    state: LoopState::Continue,
                    arrivals: 0,
                }),
                wake: Condvar::new(),
                owner: Mutex::new(Ownership::default()),
                released: Condvar::new(),
                threads,
            }),
            driver: Arc::new(driver),
        }
    }

    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    /// Add a step to the end of the round.
    ///
    /// Safe to call while the loop runs; the step joins the next round.
    pub fn append<F>(&self, step: F) -> &Self
    where
        F: Fn(&Loop<P>, Option<&P>) + Send + Sync + 'static,
    {
        lock(&self.shared.code).push(Arc::new(step));
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        lock(&self.shared.code).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> LoopState {
        lock(&self.shared.control).state
    }

    /// Number of posts waiting for the next tick.
    pub fn pending_posts(&self) -> usize {
        lock(&self.shared.posts).len()
    }

    /// True while some thread is running the loop.
    pub fn is_alive(&self) -> bool {
        lock(&self.shared.owner).runner.is_some()
    }

    /// True if the calling thread is the one running the loop.
    pub fn is_current(&self) -> bool {
        lock(&self.shared.owner).runner == Some(thread::current().id())
    }

    /// Set the state and wake the loop if it sleeps.
    pub fn notify(&self, state: LoopState) {
        let mut control = lock(&self.shared.control);
        control.state = state;
        self.shared.wake.notify_all();
        tracing::trace!(loop_id = %self.shared.id, state = ?state, "Loop notified");
    }

    /// Run the loop on the calling thread, starting in CONTINUE.
    pub fn start(&self) -> Result<()> {
        self.start_with(LoopState::Continue)
    }

    /// Run the loop on the calling thread until it stops.
    ///
    /// Fails immediately if any thread already runs this loop.
    pub fn start_with(&self, state: LoopState) -> Result<()> {
        self.run_with(|lp| lp.reset_state(state))
    }

    /// Run the loop on a new thread, starting in CONTINUE.
    pub fn thread(&self) -> Result<JoinHandle<Result<()>>> {
        self.thread_with(LoopState::Continue)
    }

    pub fn thread_with(&self, state: LoopState) -> Result<JoinHandle<Result<()>>> {
        let lp = self.clone();
        spawn(&self.shared.threads, "loop", move || lp.start_with(state))
    }

    /// Claim ownership, let `prepare` set the run up, drive, then release.
    ///
    /// Once the driver returns the runner is cleared and the post queue is
    /// drained one last time so posts still queued see the loop as finished.
    /// The loop cannot be claimed again until that drain is over.
    pub(crate) fn run_with<F>(&self, prepare: F) -> Result<()>
    where
        F: FnOnce(&Self),
    {
        let owner = self.claim()?;
        prepare(self);
        tracing::debug!(loop_id = %self.shared.id, "Loop started");

        self.driver.drive(self);

        owner.begin_final_drain();
        tracing::debug!(loop_id = %self.shared.id, "Loop finished");
        self.drain_posts();
        drop(owner);
        Ok(())
    }

    /// Fails if a thread runs the loop. Waits out the final drain of a run
    /// that just ended, unless the caller is the thread performing it.
    fn claim(&self) -> Result<OwnerGuard<'_, P>> {
        let current = thread::current().id();
        let owner = lock(&self.shared.owner);
        if owner.runner.is_some() || owner.finishing == Some(current) {
            return Err(TickloopError::AlreadyOwned(self.shared.id));
        }

        let mut owner = wait_while(&self.shared.released, owner, |o| {
            o.runner.is_none() && o.finishing.is_some()
        });
        if owner.runner.is_some() {
            return Err(TickloopError::AlreadyOwned(self.shared.id));
        }
        owner.runner = Some(current);
        Ok(OwnerGuard { shared: &self.shared })
    }

    /// Overwrite the state at the start of a run.
    pub(crate) fn reset_state(&self, state: LoopState) {
        let (_code, mut control) = self.lock_code_and_state();
        control.state = state;
        self.shared.wake.notify_all();
    }

    fn lock_code_and_state(&self) -> (MutexGuard<'_, Vec<Step<P>>>, MutexGuard<'_, Control>) {
        let code = lock(&self.shared.code);
        let control = lock(&self.shared.control);
        (code, control)
    }

    /// Run one round of steps, ticking before each step and after the last.
    ///
    /// Drivers call this from the owning thread. Returns `Stop` as soon as a
    /// tick sees BREAK; the remaining steps of the round are skipped.
    pub fn next(&self, param: Option<&P>) -> Flow {
        if !self.is_current() {
            tracing::warn!(loop_id = %self.shared.id, "next() called outside the owning thread");
            return Flow::Stop;
        }

        let steps: Vec<Step<P>> = lock(&self.shared.code).clone();
        if steps.is_empty() {
            thread::yield_now();
        }

        for step in &steps {
            if self.tick().is_stop() {
                return Flow::Stop;
            }
            step(self, param);
        }
        self.tick()
    }

    fn tick(&self) -> Flow {
        loop {
            let seen = lock(&self.shared.control).arrivals;
            self.drain_posts();

            let control = lock(&self.shared.control);
            let control = wait_while(&self.shared.wake, control, |c| {
                c.state == LoopState::Sleep && c.arrivals == seen
            });
            match control.state {
                LoopState::Continue => return Flow::Proceed,
                LoopState::Break => return Flow::Stop,
                // Woken by a post; drain it and go back to sleep
                LoopState::Sleep => continue,
            }
        }
    }

    fn drain_posts(&self) {
        let mut batch = Batch {
            queue: &self.shared.posts,
            pending: std::mem::take(&mut *lock(&self.shared.posts)),
            kept: Vec::new(),
        };
        while let Some(mut post) = batch.pending.pop_front() {
            if post().is_keep() {
                batch.kept.push(post);
            }
        }
    }

    fn enqueue(&self, post: LoopPost) {
        lock(&self.shared.posts).push_back(post);
        let mut control = lock(&self.shared.control);
        control.arrivals = control.arrivals.wrapping_add(1);
        self.shared.wake.notify_all();
    }

    /// Queue `action` for the loop's thread. It runs at the next tick and
    /// stays queued for as long as it returns [`Retain::Keep`].
    pub fn post<F>(&self, action: F)
    where
        F: FnMut() -> Retain + Send + 'static,
    {
        self.enqueue(Box::new(action));
    }

    /// Queue `action`, or run `alter` on a new thread if nobody runs the loop.
    ///
    /// If the run ends before `action` gets its first turn, `alter` runs
    /// during the final drain instead. Exactly one of the two runs.
    pub fn post_or<F, A>(&self, action: F, alter: A) -> Result<()>
    where
        F: FnMut() -> Retain + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        let owner = lock(&self.shared.owner);
        if owner.runner.is_none() {
            drop(owner);
            tracing::debug!(loop_id = %self.shared.id, "Loop idle, running alternate");
            spawn(&self.shared.threads, "alternate", alter)?;
            return Ok(());
        }
        // Holding the owner guard keeps the run from ending before the post is queued.
        self.enqueue(self.or_alternate(action, alter, None));
        drop(owner);
        Ok(())
    }

    /// Race `action` against a timer of `millis` milliseconds.
    ///
    /// Whichever fires first runs; the other is suppressed.
    pub fn post_within<F, A>(&self, action: F, alter: A, millis: i64) -> Result<()>
    where
        F: FnMut() -> Retain + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        let timeout = check_timeout(millis)?;
        let race = Arc::new(Rendezvous::new());

        let timer = race.clone();
        let loop_id = self.shared.id;
        spawn(&self.shared.threads, "timer", move || {
            timer.wait_settled(timeout);
            if timer.claim() {
                tracing::debug!(loop_id = %loop_id, "Post timed out, running alternate");
                alter();
                timer.finish(Resolved::Alternate);
            }
        })?;

        self.enqueue(single_flight(action, race));
        Ok(())
    }

    /// Run `action` on the loop's thread and block until it has run.
    pub fn synchronously<F>(&self, action: F) -> Result<Resolved>
    where
        F: FnMut() -> Retain + Send + 'static,
    {
        self.reject_reentrant("synchronously")?;
        let rendezvous = Arc::new(Rendezvous::new());
        self.enqueue(single_flight(action, rendezvous.clone()));
        Ok(rendezvous.wait())
    }

    /// Like [`synchronously`](Self::synchronously), but if nobody runs the
    /// loop `alter` runs on the calling thread instead.
    pub fn synchronously_or<F, A>(&self, action: F, alter: A) -> Result<Resolved>
    where
        F: FnMut() -> Retain + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        self.reject_reentrant("synchronously_or")?;

        let owner = lock(&self.shared.owner);
        if owner.runner.is_none() {
            drop(owner);
            alter();
            return Ok(Resolved::Alternate);
        }

        let rendezvous = Arc::new(Rendezvous::new());
        self.enqueue(self.or_alternate(action, alter, Some(rendezvous.clone())));
        drop(owner);
        Ok(rendezvous.wait())
    }

    /// Like [`synchronously`](Self::synchronously), but gives up after
    /// `millis` milliseconds and runs `alter` on the calling thread.
    pub fn synchronously_within<F, A>(&self, action: F, alter: A, millis: i64) -> Result<Resolved>
    where
        F: FnMut() -> Retain + Send + 'static,
        A: FnOnce(),
    {
        let timeout = check_timeout(millis)?;
        self.reject_reentrant("synchronously_within")?;

        let rendezvous = Arc::new(Rendezvous::new());
        self.enqueue(single_flight(action, rendezvous.clone()));

        if !rendezvous.wait_settled(timeout) && rendezvous.claim() {
            tracing::debug!(loop_id = %self.shared.id, "Rendezvous timed out, running alternate");
            alter();
            rendezvous.finish(Resolved::Alternate);
            return Ok(Resolved::Alternate);
        }
        Ok(rendezvous.wait())
    }

    /// Block until no thread runs the loop.
    pub fn join(&self) -> Result<()> {
        self.reject_reentrant("join")?;
        let _owner = wait_while(&self.shared.released, lock(&self.shared.owner), |owner| {
            owner.runner.is_some()
        });
        Ok(())
    }

    /// Block until no thread runs the loop, or until `millis` milliseconds
    /// pass, in which case `alter` runs on the calling thread.
    pub fn join_within<A>(&self, millis: i64, alter: A) -> Result<Resolved>
    where
        A: FnOnce(),
    {
        let timeout = check_timeout(millis)?;
        self.reject_reentrant("join_within")?;

        let (owner, timed_out) = wait_timeout_while(
            &self.shared.released,
            lock(&self.shared.owner),
            timeout,
            |owner| owner.runner.is_some(),
        );
        drop(owner);

        if timed_out {
            alter();
            return Ok(Resolved::Alternate);
        }
        Ok(Resolved::Action)
    }

    fn reject_reentrant(&self, operation: &str) -> Result<()> {
        if self.is_current() {
            return Err(TickloopError::Reentrant(format!(
                "{} from the thread running {}",
                operation, self.shared.id
            )));
        }
        Ok(())
    }

    /// Wrap `action` so that, if the run ends before its first turn, `alter`
    /// runs during the final drain instead.
    fn or_alternate<F, A>(&self, mut action: F, alter: A, rendezvous: Option<Arc<Rendezvous>>) -> LoopPost
    where
        F: FnMut() -> Retain + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        let shared: Weak<Shared<P>> = Arc::downgrade(&self.shared);
        let mut alter = Some(alter);
        Box::new(move || {
            let running = shared
                .upgrade()
                .is_some_and(|s| lock(&s.owner).runner == Some(thread::current().id()));

            if running {
                if alter.take().is_none() {
                    return action();
                }
                let _finish = rendezvous
                    .as_deref()
                    .filter(|rendezvous| rendezvous.claim())
                    .map(|rendezvous| rendezvous.finish_on_drop(Resolved::Action));
                return action();
            }

            if let Some(alter) = alter.take() {
                let _finish = rendezvous
                    .as_deref()
                    .filter(|rendezvous| rendezvous.claim())
                    .map(|rendezvous| rendezvous.finish_on_drop(Resolved::Alternate));
                alter();
            }
            Retain::Drop
        })
    }
}

/// Run `action` only if it wins `race`; afterwards keep running it for as
/// long as it asks to stay queued.
fn single_flight<F>(mut action: F, race: Arc<Rendezvous>) -> LoopPost
where
    F: FnMut() -> Retain + Send + 'static,
{
    let mut won = false;
    Box::new(move || {
        if won {
            return action();
        }
        if !race.claim() {
            return Retain::Drop;
        }
        won = true;
        let _finish = race.finish_on_drop(Resolved::Action);
        action()
    })
}
