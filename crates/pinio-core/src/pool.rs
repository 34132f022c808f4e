//! Borrowed-thread contract.
//!
//! The socket port and the gateway never spawn threads of their own for
//! dispatch or housekeeping. They borrow threads from a [`ThreadPool`]
//! and hand each one an [`Employer`]: the borrowed thread loops
//! `has_job` → `do_job` until the borrow is released, sleeping up to
//! `idle_timeout` (or until woken) whenever there is nothing to do.
//!
//! # Implementors
//!
//! - `FixedPool` (pinio-module, default): N OS threads created up front.

use crate::error::Result;
use crate::ident::Ident;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Work source for a borrowed thread.
///
/// `ident` is the value passed to `borrow_thread`; the employer uses it to
/// keep per-thread state. Both methods run on the borrowed thread.
pub trait Employer: Send + Sync {
    /// Is there work? May block briefly (e.g. waiting on a completion).
    fn has_job(&self, ident: Ident) -> bool;

    /// Perform one unit of work found by the preceding `has_job`.
    fn do_job(&self, ident: Ident);
}

/// Lends threads to employers.
///
/// **Contract:**
/// - `borrow_thread()` never blocks. If every thread is lent out it
///   returns `Err(PoolExhausted)`.
/// - A borrowed thread serves exactly one employer until the returned
///   [`BorrowedThread`] is released or dropped.
pub trait ThreadPool: Send + Sync {
    fn borrow_thread(
        &self,
        ident: Ident,
        employer: Arc<dyn Employer>,
        idle_timeout: Duration,
    ) -> Result<BorrowedThread>;

    fn total_threads(&self) -> usize;

    fn borrowed_threads(&self) -> usize;
}

#[derive(Default)]
struct SignalState {
    pending: bool,
    stopped: bool,
}

/// Wake-up / stop signal shared between a borrower and its thread.
#[derive(Default)]
pub struct ThreadSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl ThreadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the current (or next) idle wait short.
    pub fn wakeup(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        self.cond.notify_one();
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Idle wait. Returns `false` once stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.pending && !state.stopped && !timeout.is_zero() {
            self.cond.wait_for(&mut state, timeout);
        }
        state.pending = false;
        !state.stopped
    }
}

/// Handle to a lent thread. Dropping it releases the thread.
pub struct BorrowedThread {
    ident: Ident,
    signal: Arc<ThreadSignal>,
}

impl BorrowedThread {
    pub fn new(ident: Ident, signal: Arc<ThreadSignal>) -> Self {
        Self { ident, signal }
    }

    pub fn ident(&self) -> Ident {
        self.ident
    }

    pub fn wakeup(&self) {
        self.signal.wakeup();
    }

    /// Ask the thread to return to its pool after the current job.
    pub fn release(&self) {
        self.signal.stop();
    }
}

impl Drop for BorrowedThread {
    fn drop(&mut self) {
        self.signal.stop();
    }
}
