//! # Task lifecycle
//!
//! A [`Task`](TaskDef) is a discrete unit of work tracked through an explicit
//! state machine. The enum ordering follows the lifecycle, so `<` compares
//! states: anything at or past [`TaskStatus::Done`] is finished.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle states, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Initial putting-the-task-together state.
    NotSubmitted,
    /// Submitted, waiting for a worker.
    Waiting,
    /// A worker is running it.
    Running,
    /// Stop requested but not yet processed.
    Stopping,
    /// Finished cleanly.
    Done,
    /// Finished with an error.
    Error,
    /// Finished because the caller cancelled it.
    Cancelled,
}

impl TaskStatus {
    /// True for the terminal states `Done`, `Error` and `Cancelled`;
    /// false for everything earlier (including `Stopping`).
    pub fn is_finished(self) -> bool {
        self >= TaskStatus::Done
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Stopping)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::NotSubmitted
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSubmitted => write!(f, "not_submitted"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_submitted" => Ok(Self::NotSubmitted),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit `cancel()` from a caller.
    Cancelled,
    /// The task overran its configured max runtime.
    TimedOut,
}

/// Cooperative stop signal threaded through a task's work function.
///
/// There is no forced thread kill anywhere in this toolkit: work that never
/// checks its token will not be stopped promptly. That is a documented
/// limitation, not a bug to paper over.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    // 0 = not requested, 1 = cancelled, 2 = timed out; first writer wins.
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: StopReason) {
        let value = match reason {
            StopReason::Cancelled => 1,
            StopReason::TimedOut => 2,
        };
        let _ = self
            .state
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.state.load(Ordering::Acquire) {
            1 => Some(StopReason::Cancelled),
            2 => Some(StopReason::TimedOut),
            _ => None,
        }
    }
}

/// Handed to every task's work function.
pub struct TaskContext {
    cancel: CancelToken,
}

impl TaskContext {
    pub(crate) fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_stopped()
    }

    /// Bail out of the work function once a stop has been requested.
    /// Long-running work should call this at convenient safe points.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        match self.cancel.reason() {
            None => Ok(()),
            Some(StopReason::Cancelled) => Err(anyhow::anyhow!("task cancelled")),
            Some(StopReason::TimedOut) => Err(anyhow::anyhow!("task exceeded its max runtime")),
        }
    }
}

/// Serializable descriptor used by the runner's best-effort dump/reload of
/// pending work. `kind` tells the reloader which work function to rebuild;
/// `payload` is whatever the task needs to reconstruct itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    pub name: String,
    pub dedup_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A unit of work plus its submission metadata. Built with setters, consumed
/// by [`crate::runner::TaskRunner::submit`].
///
/// The dedup key is the task's identity: the runner refuses a second task
/// with an equal key while the first is waiting or running. It defaults to
/// the task name.
pub struct TaskDef<V> {
    pub(crate) name: String,
    pub(crate) dedup_key: String,
    pub(crate) max_runtime: Option<Duration>,
    pub(crate) spec: Option<TaskSpec>,
    pub(crate) work: Box<dyn FnOnce(&TaskContext) -> anyhow::Result<V> + Send>,
    pub(crate) cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl<V> TaskDef<V> {
    pub fn new(
        name: impl Into<String>,
        work: impl FnOnce(&TaskContext) -> anyhow::Result<V> + Send + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            dedup_key: name.clone(),
            name,
            max_runtime: None,
            spec: None,
            work: Box::new(work),
            cleanup: None,
        }
    }

    /// Override the identity used for duplicate detection.
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    /// Arm a timeout: once exceeded, the task's stop token fires and the
    /// task ends in `Error`.
    pub fn max_runtime(mut self, max: Duration) -> Self {
        self.max_runtime = Some(max);
        self
    }

    /// Attach a serializable spec so this task survives
    /// [`crate::runner::TaskRunner::flush_to_disk`] / `load`.
    pub fn spec(mut self, spec: TaskSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Task-specific cleanup, run exactly once when the task closes,
    /// whatever way it ended. Its own failure is logged, never propagated.
    pub fn on_close(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

/// Wall-clock plus monotonic timestamp pair.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stamp {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

impl Stamp {
    fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }
}

/// Receives the one retirement notification per task. Implemented by the
/// runner: a task that reaches a terminal state must leave the live todo
/// bookkeeping at once, whichever path got it there.
pub(crate) trait TaskObserver: Send + Sync {
    fn task_retired(&self, core: &Arc<TaskCore>);
}

#[derive(Default)]
struct TaskState {
    status: TaskStatus,
    queued: Option<Stamp>,
    started: Option<Stamp>,
    ended: Option<Stamp>,
    error: Option<Arc<anyhow::Error>>,
}

/// Shared, type-erased task bookkeeping. One per submitted task; referenced
/// by the handle, the runner's todo map and the timeout watchdog.
pub(crate) struct TaskCore {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) dedup_key: String,
    pub(crate) max_runtime: Option<Duration>,
    pub(crate) spec: Option<TaskSpec>,
    pub(crate) cancel: CancelToken,
    closed: AtomicBool,
    retired: AtomicBool,
    observer: Mutex<Option<Weak<dyn TaskObserver>>>,
    state: Mutex<TaskState>,
    state_cv: Condvar,
}

impl TaskCore {
    pub(crate) fn new(
        name: String,
        dedup_key: String,
        max_runtime: Option<Duration>,
        spec: Option<TaskSpec>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            dedup_key,
            max_runtime,
            spec,
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            observer: Mutex::new(None),
            state: Mutex::new(TaskState::default()),
            state_cv: Condvar::new(),
        }
    }

    pub(crate) fn set_observer(&self, observer: Weak<dyn TaskObserver>) {
        *self.observer.lock() = Some(observer);
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Advance the status, keeping the lifecycle monotonic: backward moves
    /// and moves out of a terminal state are ignored.
    pub(crate) fn advance(&self, status: TaskStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_finished() || status <= state.status {
            return false;
        }
        state.status = status;
        self.state_cv.notify_all();
        true
    }

    pub(crate) fn mark_queued(&self) {
        self.state.lock().queued = Some(Stamp::now());
    }

    pub(crate) fn mark_started(&self) {
        self.state.lock().started = Some(Stamp::now());
    }

    pub(crate) fn mark_ended(&self) {
        let mut state = self.state.lock();
        if state.ended.is_none() {
            state.ended = Some(Stamp::now());
        }
    }

    pub(crate) fn set_error(&self, error: anyhow::Error) {
        self.state.lock().error = Some(Arc::new(error));
    }

    pub(crate) fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.state.lock().error.clone()
    }

    /// First close wins; later calls are no-ops.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// First retirement wins; the owner's bookkeeping runs once per task.
    pub(crate) fn mark_retired(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    /// Tell the observer this task left the live set. Gated: cancel of a
    /// waiting task and the worker's close path can both get here, only the
    /// first notification goes through.
    pub(crate) fn notify_retired(self: &Arc<Self>) {
        if !self.mark_retired() {
            return;
        }
        let observer = self.observer.lock().clone().and_then(|w| w.upgrade());
        if let Some(observer) = observer {
            observer.task_retired(self);
        }
    }

    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.status.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.state_cv
                .wait_for(&mut state, deadline.saturating_duration_since(now));
        }
        true
    }

    pub(crate) fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().queued.map(|s| s.wall)
    }

    pub(crate) fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started.map(|s| s.wall)
    }

    pub(crate) fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ended.map(|s| s.wall)
    }

    /// Time spent queued. Falls back to zero if never queued.
    pub(crate) fn queue_time(&self) -> Duration {
        let state = self.state.lock();
        match state.queued {
            None => Duration::ZERO,
            Some(q) => {
                let until = state.started.map(|s| s.mono).unwrap_or_else(Instant::now);
                until.saturating_duration_since(q.mono)
            }
        }
    }

    /// Time spent actually running. Falls back to zero if never started.
    pub(crate) fn running_time(&self) -> Duration {
        let state = self.state.lock();
        match state.started {
            None => Duration::ZERO,
            Some(s) => {
                let until = state.ended.map(|e| e.mono).unwrap_or_else(Instant::now);
                until.saturating_duration_since(s.mono)
            }
        }
    }
}

/// Caller-side view of a submitted task.
pub struct TaskHandle<V> {
    core: Arc<TaskCore>,
    output: Arc<Mutex<Option<V>>>,
}

impl<V> std::fmt::Debug for TaskHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl<V> Clone for TaskHandle<V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            output: Arc::clone(&self.output),
        }
    }
}

impl<V> TaskHandle<V> {
    pub(crate) fn new(core: Arc<TaskCore>, output: Arc<Mutex<Option<V>>>) -> Self {
        Self { core, output }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn dedup_key(&self) -> &str {
        &self.core.dedup_key
    }

    pub fn status(&self) -> TaskStatus {
        self.core.status()
    }

    pub fn is_finished(&self) -> bool {
        self.core.status().is_finished()
    }

    /// Block until the task reaches a terminal state, or the timeout
    /// elapses. Returns true if it finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.core.wait_finished(timeout)
    }

    /// Take the output. Present only once the task is `Done`, and only for
    /// the first caller.
    pub fn take_output(&self) -> Option<V> {
        if self.core.status() != TaskStatus::Done {
            return None;
        }
        self.output.lock().take()
    }

    /// The captured failure. Present only once the task is `Error`.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.core.error()
    }

    /// Cancel this task.
    ///
    /// Waiting tasks go straight to `Cancelled`, leave the runner's todo
    /// bookkeeping at once (their identity is free for resubmission
    /// immediately) and are skipped over instead of running. Running tasks
    /// get a cooperative stop request: the status moves to `Stopping` and
    /// the work's stop token fires; the task ends `Cancelled` once the work
    /// returns.
    pub fn cancel(&self) {
        let status = self.core.status();
        if status.is_finished() {
            return;
        }
        self.core.cancel.request(StopReason::Cancelled);
        if status < TaskStatus::Running {
            if self.core.advance(TaskStatus::Cancelled) {
                self.core.mark_ended();
                // the skipped pool job later runs only the cleanup hook
                self.core.notify_retired();
            }
        } else {
            self.core.advance(TaskStatus::Stopping);
        }
    }

    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.core.queued_at()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.core.started_at()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.core.ended_at()
    }

    pub fn queue_time(&self) -> Duration {
        self.core.queue_time()
    }

    pub fn running_time(&self) -> Duration {
        self.core.running_time()
    }
}
