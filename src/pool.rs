//! # WorkerPool / SafeExecutor
//!
//! A fixed-size pool of named OS threads pulling boxed jobs from a channel,
//! and a thin decorator that guarantees a panicking job is logged and
//! retained rather than silently swallowed. Thread pools quietly eating
//! failures is dangerous; nothing here is allowed to fail without at least a
//! log entry.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Result, TaskmillError};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct PoolShared {
    name: String,
    // Workers still draining or running; guarded count + condvar so
    // `await_termination` can sleep until the pool empties.
    live: Mutex<usize>,
    live_cv: Condvar,
    discard: AtomicBool,
}

/// A fixed-size worker pool. `shutdown` closes the intake; workers finish
/// the queued jobs and exit.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    tx: Mutex<Option<Sender<Job>>>,
}

impl WorkerPool {
    /// Spawn `threads` named workers. Fails when a worker thread cannot be
    /// spawned; already-started workers then exit as the intake drops.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(TaskmillError::Configuration(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        let (tx, rx) = channel::unbounded::<Job>();
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            live: Mutex::new(threads),
            live_cv: Condvar::new(),
            discard: AtomicBool::new(false),
        });
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if shared.discard.load(Ordering::Acquire) {
                            continue;
                        }
                        job();
                    }
                    debug!(pool = %shared.name, "worker exiting");
                    let mut live = shared.live.lock();
                    *live -= 1;
                    shared.live_cv.notify_all();
                })?;
        }
        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
        })
    }

    /// Hand a job to the pool. Fails once the pool is shut down.
    pub fn execute(&self, job: Job) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).map_err(|_| TaskmillError::Shutdown),
            None => Err(TaskmillError::Shutdown),
        }
    }

    /// Close the intake. Queued jobs still run; workers exit once drained.
    pub fn shutdown(&self) {
        self.tx.lock().take();
    }

    /// Close the intake and discard queued jobs without running them.
    pub fn shutdown_now(&self) {
        self.shared.discard.store(true, Ordering::Release);
        self.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Block until every worker has exited, or the timeout elapses.
    /// Without a prior `shutdown` the workers never exit, so this simply
    /// runs out the timeout and returns false.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live.lock();
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared
                .live_cv
                .wait_for(&mut live, deadline.saturating_duration_since(now));
        }
        true
    }
}

/// Wraps a [`WorkerPool`] so that a panicking job is caught, logged at error
/// level and kept as the last error, instead of killing a worker thread
/// silently.
pub struct SafeExecutor {
    base: WorkerPool,
    last_error: Arc<Mutex<Option<String>>>,
}

impl SafeExecutor {
    pub fn new(base: WorkerPool) -> Self {
        Self {
            base,
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn execute(&self, job: Job) -> Result<()> {
        let last_error = Arc::clone(&self.last_error);
        let pool_name = self.base.shared.name.clone();
        self.base.execute(Box::new(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                let msg = panic_message(&*panic);
                error!(pool = %pool_name, panic = %msg, "job panicked");
                *last_error.lock() = Some(msg);
            }
        }))
    }

    /// The most recent panic message, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Take the most recent panic message; a second call returns `None`.
    pub fn take_error(&self) -> Option<String> {
        self.last_error.lock().take()
    }

    pub fn shutdown(&self) {
        self.base.shutdown();
    }

    pub fn shutdown_now(&self) {
        self.base.shutdown_now();
    }

    pub fn is_shutdown(&self) -> bool {
        self.base.is_shutdown()
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.base.await_termination(timeout)
    }
}
