//! Instructor - coordinates every loop started through it.
//!
//! The instructor keeps a registry of the loops it is running, a default
//! state broadcast to them, and a post queue of its own. Unlike a loop's
//! posts, instructor posts are not drained automatically: a registered loop
//! services them by calling [`Instructor::tick`] from one of its steps.
//!
//! Lock order: registry, then default state, then the loop's own guards.
//! The registry is also taken before the post queue.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::{Config, ThreadConfig};
use crate::coordination::guard::{lock, wait_timeout_while, wait_while};
use crate::coordination::rendezvous::Rendezvous;
use crate::coordination::spawn::spawn;
use crate::domain::{LoopState, Resolved, Retain};
use crate::error::{Result, TickloopError, check_timeout};
use crate::id::{LoopId, generate_ticket};
use crate::loops::{Engine, Loop};

/// A queued instructor callback.
///
/// Receives the instructor, the loop servicing it (if any) and whether it
/// runs on that loop's thread.
pub type InstructorPost = Box<dyn FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send>;

struct Queued {
    ticket: u64,
    /// Delivered with `(instructor, None, false)` if still queued when the
    /// last loop leaves.
    idle_fallback: bool,
    post: InstructorPost,
}

#[derive(Default)]
struct PostQueue {
    entries: VecDeque<Queued>,
    /// Queued posts plus posts currently being run.
    outstanding: usize,
}

/// A batch taken off the queue for one service pass.
///
/// Whatever did not get to run, and whatever asked to stay, goes back to the
/// front of the queue on drop, even when a post panics mid-batch.
struct Servicing<'a> {
    queue: &'a Mutex<PostQueue>,
    pending: VecDeque<Queued>,
    kept: Vec<Queued>,
    finished: usize,
}

impl Drop for Servicing<'_> {
    fn drop(&mut self) {
        let mut posts = lock(self.queue);
        while let Some(queued) = self.pending.pop_back() {
            posts.entries.push_front(queued);
        }
        while let Some(queued) = self.kept.pop() {
            posts.entries.push_front(queued);
        }
        posts.outstanding -= self.finished;
    }
}

/// A registry entry. The token tells one run of a loop from the next.
struct Registered {
    engine: Arc<dyn Engine>,
    token: u64,
}

struct Inner {
    loops: Mutex<HashMap<LoopId, Registered>>,
    emptied: Condvar,
    default_state: Mutex<LoopState>,
    posts: Mutex<PostQueue>,
    threads: ThreadConfig,
}

/// Coordinator for a dynamic set of loops. Clones share the same instructor.
#[derive(Clone)]
pub struct Instructor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Instructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instructor")
            .field("loops", &self.loop_count())
            .field("state", &self.state())
            .field("pending_posts", &self.pending_posts())
            .finish()
    }
}

impl Default for Instructor {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a loop from the registry when its run ends.
struct Registration<'a> {
    instructor: &'a Instructor,
    id: LoopId,
    token: u64,
    armed: Cell<bool>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed.get() {
            self.instructor.deregister(self.id, self.token);
        }
    }
}

impl Instructor {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                loops: Mutex::new(HashMap::new()),
                emptied: Condvar::new(),
                default_state: Mutex::new(config.instructor.default_state),
                posts: Mutex::new(PostQueue::default()),
                threads: config.threads.clone(),
            }),
        }
    }

    /// Number of loops currently registered.
    pub fn loop_count(&self) -> usize {
        lock(&self.inner.loops).len()
    }

    /// The default state applied to loops as they start.
    pub fn state(&self) -> LoopState {
        *lock(&self.inner.default_state)
    }

    /// Number of posts waiting in the queue.
    pub fn pending_posts(&self) -> usize {
        lock(&self.inner.posts).entries.len()
    }

    /// True while at least one post is queued or being run.
    pub fn is_alive(&self) -> bool {
        lock(&self.inner.posts).outstanding > 0
    }

    /// Register `lp`, apply the default state and run it on the calling
    /// thread. The loop is deregistered when the run ends.
    pub fn start<P: 'static>(&self, lp: &Loop<P>) -> Result<()> {
        let registration = Registration {
            instructor: self,
            id: lp.id(),
            token: generate_ticket(),
            armed: Cell::new(false),
        };

        lp.run_with(|lp| {
            let mut loops = lock(&self.inner.loops);
            let default_state = lock(&self.inner.default_state);
            let state = *default_state;
            loops.insert(
                lp.id(),
                Registered {
                    engine: Arc::new(lp.clone()),
                    token: registration.token,
                },
            );
            lp.reset_state(state);
            registration.armed.set(true);
            tracing::debug!(loop_id = %lp.id(), loops = loops.len(), state = ?state, "Loop registered");
        })
    }

    /// Run [`start`](Self::start) on a new thread.
    pub fn thread<P: 'static>(&self, lp: &Loop<P>) -> Result<JoinHandle<Result<()>>> {
        let instructor = self.clone();
        let lp = lp.clone();
        spawn(&self.inner.threads, "loop", move || instructor.start(&lp))
    }

    /// Remove the run identified by `token`. A later run of the same loop
    /// may already have replaced it, in which case the registry is left alone.
    fn deregister(&self, id: LoopId, token: u64) {
        let idle = {
            let mut loops = lock(&self.inner.loops);
            if loops.get(&id).is_some_and(|registered| registered.token == token) {
                loops.remove(&id);
                tracing::debug!(loop_id = %id, loops = loops.len(), "Loop deregistered");
            }
            if !loops.is_empty() {
                return;
            }
            self.inner.emptied.notify_all();

            let mut posts = lock(&self.inner.posts);
            let (idle, rest): (VecDeque<Queued>, VecDeque<Queued>) =
                std::mem::take(&mut posts.entries).into_iter().partition(|q| q.idle_fallback);
            posts.entries = rest;
            idle
        };

        if idle.is_empty() {
            return;
        }
        tracing::debug!(posts = idle.len(), "No loops left, delivering idle posts");
        self.service(idle, None);
    }

    /// Run `batch` once. On a loop, posts that return [`Retain::Keep`] stay
    /// queued without their idle fallback. Off a loop every post runs exactly
    /// once and leaves the queue.
    fn service(&self, batch: VecDeque<Queued>, lp: Option<&dyn Engine>) {
        let on_loop = lp.is_some();
        let mut servicing = Servicing {
            queue: &self.inner.posts,
            pending: batch,
            kept: Vec::new(),
            finished: 0,
        };
        while let Some(mut queued) = servicing.pending.pop_front() {
            servicing.finished += 1;
            if (queued.post)(self, lp, on_loop).is_keep() && on_loop {
                servicing.finished -= 1;
                queued.idle_fallback = false;
                servicing.kept.push(queued);
            }
        }
    }

    /// Set the default state and broadcast it to every registered loop.
    pub fn notify(&self, state: LoopState) {
        let loops = lock(&self.inner.loops);
        let mut default_state = lock(&self.inner.default_state);
        *default_state = state;
        for registered in loops.values() {
            registered.engine.notify(state);
        }
        tracing::trace!(loops = loops.len(), state = ?state, "Instructor notified");
    }

    fn enqueue(&self, ticket: u64, idle_fallback: bool, post: InstructorPost) {
        let mut posts = lock(&self.inner.posts);
        posts.entries.push_back(Queued {
            ticket,
            idle_fallback,
            post,
        });
        posts.outstanding += 1;
    }

    fn withdraw(&self, ticket: u64) {
        let mut posts = lock(&self.inner.posts);
        if let Some(index) = posts.entries.iter().position(|q| q.ticket == ticket) {
            posts.entries.remove(index);
            posts.outstanding -= 1;
        }
    }

    /// Queue `post` until a registered loop calls [`tick`](Self::tick).
    pub fn post<F>(&self, post: F)
    where
        F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
    {
        self.enqueue(generate_ticket(), false, Box::new(post));
    }

    /// Queue `post`, or run it on a new thread if no loop is registered.
    ///
    /// A post still queued when the last loop leaves is delivered then with
    /// `ran_on_loop = false`.
    pub fn post_if_alive<F>(&self, mut post: F) -> Result<()>
    where
        F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
    {
        let loops = lock(&self.inner.loops);
        if loops.is_empty() {
            drop(loops);
            tracing::debug!("No loops registered, running post on a fallback thread");
            let instructor = self.clone();
            spawn(&self.inner.threads, "fallback", move || {
                post(&instructor, None, false);
            })?;
            return Ok(());
        }
        self.enqueue(generate_ticket(), true, Box::new(post));
        drop(loops);
        Ok(())
    }

    /// Race the first service of `post` against a timer of `millis`
    /// milliseconds. On timeout `post` runs on the timer thread with
    /// `(instructor, None, false)` and leaves the queue.
    pub fn post_within<F>(&self, millis: i64, post: F) -> Result<()>
    where
        F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
    {
        let timeout = check_timeout(millis)?;
        let race = Arc::new(Rendezvous::new());
        let post = Arc::new(Mutex::new(post));
        let ticket = generate_ticket();
        self.enqueue(ticket, false, single_flight(shared(post.clone()), race.clone()));

        let instructor = self.clone();
        let timer = spawn(&self.inner.threads, "timer", move || {
            race.wait_settled(timeout);
            if race.claim() {
                tracing::debug!(ticket, "Instructor post timed out");
                {
                    let _finish = race.finish_on_drop(Resolved::Alternate);
                    let mut post = lock(&post);
                    (*post)(&instructor, None, false);
                }
                instructor.withdraw(ticket);
            }
        });
        if let Err(e) = timer {
            self.withdraw(ticket);
            return Err(e);
        }
        Ok(())
    }

    /// Queue `post` and block until a registered loop has run it.
    pub fn synchronously<F>(&self, post: F) -> Result<Resolved>
    where
        F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
    {
        self.reject_reentrant("synchronously")?;
        let rendezvous = Arc::new(Rendezvous::new());
        self.enqueue(generate_ticket(), false, single_flight(post, rendezvous.clone()));
        Ok(rendezvous.wait())
    }

    /// Like [`synchronously`](Self::synchronously), but with no loop
    /// registered `post` runs on the calling thread instead.
    pub fn synchronously_if_alive<F>(&self, mut post: F) -> Result<Resolved>
    where
        F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
    {
        self.reject_reentrant("synchronously_if_alive")?;

        let loops = lock(&self.inner.loops);
        if loops.is_empty() {
            drop(loops);
            post(self, None, false);
            return Ok(Resolved::Alternate);
        }

        let rendezvous = Arc::new(Rendezvous::new());
        self.enqueue(generate_ticket(), true, single_flight(post, rendezvous.clone()));
        drop(loops);
        Ok(rendezvous.wait())
    }

    /// Like [`synchronously`](Self::synchronously), but after `millis`
    /// milliseconds `post` runs on the calling thread with
    /// `(instructor, None, false)` and leaves the queue.
    pub fn synchronously_within<F>(&self, millis: i64, post: F) -> Result<Resolved>
    where
        F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
    {
        let timeout = check_timeout(millis)?;
        self.reject_reentrant("synchronously_within")?;

        let rendezvous = Arc::new(Rendezvous::new());
        let post = Arc::new(Mutex::new(post));
        let ticket = generate_ticket();
        self.enqueue(ticket, false, single_flight(shared(post.clone()), rendezvous.clone()));

        if !rendezvous.wait_settled(timeout) && rendezvous.claim() {
            tracing::debug!(ticket, "Instructor rendezvous timed out");
            {
                let _finish = rendezvous.finish_on_drop(Resolved::Alternate);
                let mut post = lock(&post);
                (*post)(self, None, false);
            }
            self.withdraw(ticket);
            return Ok(Resolved::Alternate);
        }
        Ok(rendezvous.wait())
    }

    /// Service the post queue from `lp`'s own thread.
    ///
    /// Each post runs with `(instructor, Some(lp), true)` and stays queued for
    /// as long as it returns [`Retain::Keep`].
    pub fn tick(&self, lp: &dyn Engine) -> Result<()> {
        if !lp.is_current() {
            tracing::warn!(loop_id = %lp.id(), "Instructor tick outside the loop's thread");
            return Err(TickloopError::NotOwner(lp.id()));
        }
        if !lock(&self.inner.loops).contains_key(&lp.id()) {
            return Err(TickloopError::NotRegistered(lp.id()));
        }

        let batch = std::mem::take(&mut lock(&self.inner.posts).entries);
        if !batch.is_empty() {
            self.service(batch, Some(lp));
        }
        Ok(())
    }

    /// Block until no loop is registered.
    pub fn join(&self) -> Result<()> {
        self.reject_reentrant("join")?;
        let _loops = wait_while(&self.inner.emptied, lock(&self.inner.loops), |loops| {
            !loops.is_empty()
        });
        Ok(())
    }

    /// Block until no loop is registered, or until `millis` milliseconds
    /// pass, in which case `alter` runs on the calling thread.
    pub fn join_within<A>(&self, millis: i64, alter: A) -> Result<Resolved>
    where
        A: FnOnce(),
    {
        let timeout = check_timeout(millis)?;
        self.reject_reentrant("join_within")?;

        let (loops, timed_out) = wait_timeout_while(
            &self.inner.emptied,
            lock(&self.inner.loops),
            timeout,
            |loops| !loops.is_empty(),
        );
        drop(loops);

        if timed_out {
            alter();
            return Ok(Resolved::Alternate);
        }
        Ok(Resolved::Action)
    }

    fn reject_reentrant(&self, operation: &str) -> Result<()> {
        let loops = lock(&self.inner.loops);
        if let Some(registered) = loops.values().find(|r| r.engine.is_current()) {
            return Err(TickloopError::Reentrant(format!(
                "{} from the thread running {}",
                operation,
                registered.engine.id()
            )));
        }
        Ok(())
    }
}

/// Share one post between the queue and the thread that may time it out.
/// Only the side that wins the race ever locks the cell.
fn shared<F>(post: Arc<Mutex<F>>) -> impl FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static
where
    F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
{
    move |instructor: &Instructor, lp: Option<&dyn Engine>, on_loop: bool| {
        let mut post = lock(&post);
        (*post)(instructor, lp, on_loop)
    }
}

/// Run `post` only if it wins `race`; afterwards keep running it for as long
/// as it asks to stay queued. The race resolves to `Action` when won on a
/// loop thread and to `Alternate` otherwise.
fn single_flight<F>(mut post: F, race: Arc<Rendezvous>) -> InstructorPost
where
    F: FnMut(&Instructor, Option<&dyn Engine>, bool) -> Retain + Send + 'static,
{
    let mut won = false;
    Box::new(
        move |instructor: &Instructor, lp: Option<&dyn Engine>, on_loop: bool| {
            if won {
                return post(instructor, lp, on_loop);
            }
            if !race.claim() {
                return Retain::Drop;
            }
            won = true;
            let resolved = if on_loop { Resolved::Action } else { Resolved::Alternate };
            let _finish = race.finish_on_drop(resolved);
            post(instructor, lp, on_loop)
        },
    )
}
