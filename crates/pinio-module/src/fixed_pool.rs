//! `FixedPool` — default `ThreadPool` implementation.
//!
//! Spawns N OS threads at creation. Idle threads wait for an assignment;
//! a borrowed thread runs its employer's `has_job`/`do_job` loop until
//! the borrower releases it, then goes back to waiting.
//!
//! No dynamic scaling. Simple, predictable, safe.

use pinio_core::error::{Error, Result};
use pinio_core::ident::Ident;
use pinio_core::pool::{BorrowedThread, Employer, ThreadPool, ThreadSignal};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on how long an idle worker sleeps before re-checking
/// the shutdown flag.
const IDLE_PARK: Duration = Duration::from_millis(100);

struct Assignment {
    ident: Ident,
    employer: Arc<dyn Employer>,
    idle_timeout: Duration,
    signal: Arc<ThreadSignal>,
}

/// Shared state between borrowers and workers.
struct PoolInner {
    /// Pending assignments: borrower → idle worker.
    assignments: ArrayQueue<Assignment>,
    /// Idle workers park here.
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
    /// Threads currently lent out (or about to be).
    borrowed: AtomicUsize,
    /// Signals of live borrows, stopped on shutdown.
    active: Mutex<Vec<Arc<ThreadSignal>>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Total worker count.
    total: usize,
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FixedPool {
    /// Create a pool with `n` workers.
    pub fn new(n: usize) -> Self {
        let n = n.clamp(1, 256);
        let inner = Arc::new(PoolInner {
            assignments: ArrayQueue::new(n),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
            borrowed: AtomicUsize::new(0),
            active: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            total: n,
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("pinio-worker-{}", worker_id))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        FixedPool {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Default pool sizing: nproc clamped to 4..=16.
    pub fn auto_sized() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(cpus.clamp(4, 16))
    }

    /// Stop accepting borrows and join every worker.
    ///
    /// Borrowed threads finish their current `has_job`/`do_job` first.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for signal in self.inner.active.lock().iter() {
            signal.stop();
        }
        {
            let _guard = self.inner.idle_lock.lock();
            self.inner.idle_cond.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl ThreadPool for FixedPool {
    fn borrow_thread(
        &self,
        ident: Ident,
        employer: Arc<dyn Employer>,
        idle_timeout: Duration,
    ) -> Result<BorrowedThread> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::ShuttingDown);
        }
        let total = self.inner.total;
        self.inner
            .borrowed
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                (n < total).then_some(n + 1)
            })
            .map_err(|_| Error::PoolExhausted)?;

        let signal = Arc::new(ThreadSignal::new());
        self.inner.active.lock().push(Arc::clone(&signal));
        let assignment = Assignment {
            ident,
            employer,
            idle_timeout,
            signal: Arc::clone(&signal),
        };
        if self.inner.assignments.push(assignment).is_err() {
            self.inner.active.lock().retain(|s| !Arc::ptr_eq(s, &signal));
            self.inner.borrowed.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::PoolExhausted);
        }
        {
            let _guard = self.inner.idle_lock.lock();
            self.inner.idle_cond.notify_one();
        }
        tracing::debug!(%ident, "thread borrowed");
        Ok(BorrowedThread::new(ident, signal))
    }

    fn total_threads(&self) -> usize {
        self.inner.total
    }

    fn borrowed_threads(&self) -> usize {
        self.inner.borrowed.load(Ordering::Relaxed)
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let _guard = self.inner.idle_lock.lock();
        self.inner.idle_cond.notify_all();
        // Workers exit on their own; call shutdown() to join.
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>) {
    while let Some(assignment) = next_assignment(&inner) {
        serve(&inner, &assignment);
        inner
            .active
            .lock()
            .retain(|s| !Arc::ptr_eq(s, &assignment.signal));
        inner.borrowed.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(ident = %assignment.ident, "thread returned to pool");
    }
}

fn next_assignment(inner: &PoolInner) -> Option<Assignment> {
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            return None;
        }
        if let Some(assignment) = inner.assignments.pop() {
            return Some(assignment);
        }
        let mut guard = inner.idle_lock.lock();
        if inner.assignments.is_empty() && !inner.shutdown.load(Ordering::Relaxed) {
            inner.idle_cond.wait_for(&mut guard, IDLE_PARK);
        }
    }
}

/// Run the employer loop until released.
fn serve(inner: &PoolInner, job: &Assignment) {
    while !job.signal.is_stopped() && !inner.shutdown.load(Ordering::Relaxed) {
        let worked = catch_unwind(AssertUnwindSafe(|| {
            if job.employer.has_job(job.ident) {
                job.employer.do_job(job.ident);
                true
            } else {
                false
            }
        }));
        match worked {
            Ok(true) => {}
            Ok(false) => {
                if !job.signal.wait(job.idle_timeout) {
                    break;
                }
            }
            Err(_) => {
                tracing::error!(ident = %job.ident, "employer panicked; continuing");
            }
        }
    }
}
