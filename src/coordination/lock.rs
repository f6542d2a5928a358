//! Transferable lock over a shared target.
//!
//! A `Lock<T>` lets its master thread hold a target's mutex across calls that
//! do not share a lexical scope: `lock()` in one function, `unlock()` in
//! another. std's `MutexGuard` borrows its mutex and cannot be stored next to
//! the `Arc` that owns it, so a dedicated holder thread takes the guard
//! instead and parks while holding it.
//!
//! The master and the holder talk through a handshake cell:
//!
//! 1. the master writes a signal (LOCK, UNLOCK or CLOSE), bumps the request
//!    counter and wakes the holder
//! 2. the holder acts on the signal, acknowledges the request and parks until
//!    the signal changes
//! 3. the master returns once the acknowledgement matches its request

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::config::ThreadConfig;
use crate::coordination::guard::{lock, wait_while};
use crate::coordination::spawn::spawn;
use crate::error::{Result, TickloopError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Lock,
    Unlock,
    Close,
}

#[derive(Debug)]
struct Handshake {
    signal: Signal,
    request: u64,
    ack: u64,
    holder: Option<ThreadId>,
}

#[derive(Debug)]
struct Shared {
    handshake: Mutex<Handshake>,
    changed: Condvar,
}

/// A lock that is acquired in one call and released in another.
///
/// Only the thread that created the lock (its master) may call
/// [`lock`](Self::lock), [`unlock`](Self::unlock) or [`close`](Self::close).
/// Any other thread contends for the target through [`target`](Self::target)
/// as usual and blocks while the master holds it.
pub struct Lock<T = ()> {
    target: Arc<Mutex<T>>,
    master: ThreadId,
    shared: Arc<Shared>,
    holder: Option<JoinHandle<()>>,
    closed: bool,
    threads: ThreadConfig,
}

impl Lock<()> {
    /// A lock protecting nothing but itself.
    pub fn new() -> Self {
        Self::with_target(Arc::new(Mutex::new(())))
    }
}

impl Default for Lock<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Lock<T> {
    /// A lock over a target shared with the rest of the application.
    pub fn with_target(target: Arc<Mutex<T>>) -> Self {
        Self::with_config(target, ThreadConfig::default())
    }

    pub fn with_config(target: Arc<Mutex<T>>, threads: ThreadConfig) -> Self {
        Self {
            target,
            master: thread::current().id(),
            shared: Arc::new(Shared {
                handshake: Mutex::new(Handshake {
                    signal: Signal::Unlock,
                    request: 0,
                    ack: 0,
                    holder: None,
                }),
                changed: Condvar::new(),
            }),
            holder: None,
            closed: false,
            threads,
        }
    }

    /// The protected object.
    pub fn target(&self) -> &Arc<Mutex<T>> {
        &self.target
    }

    /// True while the holder thread sits on the target's mutex.
    pub fn is_locked(&self) -> bool {
        self.holder.is_some() && lock(&self.shared.handshake).signal == Signal::Lock
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Acquire the target's mutex on behalf of the master thread.
    ///
    /// Starts the holder thread on first use. Returns once the holder owns the
    /// mutex. A no-op when already locked.
    pub fn lock(&mut self) -> Result<()> {
        self.check_master()?;
        if self.closed {
            return Err(TickloopError::LockClosed);
        }

        let mut handshake = lock(&self.shared.handshake);
        if self.holder.is_some() && handshake.signal == Signal::Lock {
            return Ok(());
        }
        handshake.signal = Signal::Lock;
        handshake.request += 1;

        if self.holder.is_none() {
            let shared = self.shared.clone();
            let target = self.target.clone();
            let handle = spawn(&self.threads, "lock", move || {
                if let Err(e) = hold(&shared, &target) {
                    tracing::warn!(error = %e, "Lock holder refused to run");
                }
            })?;
            // The holder cannot read the handshake before this guard is released.
            handshake.holder = Some(handle.thread().id());
            self.holder = Some(handle);
            tracing::debug!("Lock holder started");
        }

        self.shared.changed.notify_all();
        let _acked = wait_while(&self.shared.changed, handshake, |h| h.ack != h.request);
        Ok(())
    }

    /// Release the target's mutex.
    ///
    /// A no-op if the lock was never taken, is already released, or is closed.
    pub fn unlock(&mut self) -> Result<()> {
        self.check_master()?;
        if self.closed || self.holder.is_none() {
            return Ok(());
        }

        let mut handshake = lock(&self.shared.handshake);
        if handshake.signal != Signal::Lock {
            return Ok(());
        }
        self.signal(handshake, Signal::Unlock);
        Ok(())
    }

    /// Release the target if held and stop the holder thread for good.
    ///
    /// Blocks until the holder thread has exited. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.check_master()?;
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(holder) = self.holder.take() else {
            lock(&self.shared.handshake).signal = Signal::Close;
            return Ok(());
        };

        let handshake = lock(&self.shared.handshake);
        self.signal(handshake, Signal::Close);
        if holder.join().is_err() {
            tracing::warn!("Lock holder panicked");
        }
        tracing::debug!("Lock closed");
        Ok(())
    }

    fn signal(&self, mut handshake: std::sync::MutexGuard<'_, Handshake>, signal: Signal) {
        handshake.signal = signal;
        handshake.request += 1;
        self.shared.changed.notify_all();
        let _acked = wait_while(&self.shared.changed, handshake, |h| h.ack != h.request);
    }

    fn check_master(&self) -> Result<()> {
        if thread::current().id() != self.master {
            tracing::warn!("Lock used from a thread other than its master");
            return Err(TickloopError::NotMaster);
        }
        Ok(())
    }
}

impl<T> Drop for Lock<T> {
    fn drop(&mut self) {
        if self.closed || self.holder.is_none() {
            return;
        }
        // Tell the holder to exit without waiting on it.
        let mut handshake = lock(&self.shared.handshake);
        handshake.signal = Signal::Close;
        handshake.request += 1;
        self.shared.changed.notify_all();
    }
}

/// Body of the holder thread.
fn hold<T>(shared: &Shared, target: &Mutex<T>) -> Result<()> {
    let mut handshake = lock(&shared.handshake);
    if handshake.holder != Some(thread::current().id()) {
        return Err(TickloopError::NotHolder);
    }

    loop {
        match handshake.signal {
            Signal::Unlock => {
                handshake.ack = handshake.request;
                shared.changed.notify_all();
                handshake = wait_while(&shared.changed, handshake, |h| h.signal == Signal::Unlock);
            }
            Signal::Lock => {
                drop(handshake);
                let entered = lock(target);
                handshake = lock(&shared.handshake);
                handshake.ack = handshake.request;
                shared.changed.notify_all();
                handshake = wait_while(&shared.changed, handshake, |h| h.signal == Signal::Lock);
                drop(entered);
            }
            Signal::Close => {
                handshake.ack = handshake.request;
                shared.changed.notify_all();
                tracing::debug!("Lock holder exiting");
                return Ok(());
            }
        }
    }
}
