//! # TaskRunner
//!
//! Runs tasks in an offline asynchronous manner over a bounded worker pool,
//! with some management of the queue. Intended for relatively few,
//! relatively slow tasks.
//!
//! Identity matters: submitting a task whose dedup key equals one already
//! waiting or running fails with a duplicate-task error, giving
//! at-most-one-concurrent-instance-per-identity semantics.
//!
//! ```rust
//! use std::time::Duration;
//! use taskmill::runner::TaskRunner;
//! use taskmill::task::TaskDef;
//!
//! # fn main() -> taskmill::Result<()> {
//! let runner = TaskRunner::new("background", 2)?;
//! let handle = runner.submit(TaskDef::new("ping", |_ctx| Ok("pong")))?;
//! handle.wait(Duration::from_secs(5));
//! assert_eq!(handle.take_output(), Some("pong"));
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fs::File;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::actor::SlowActor;
use crate::config::RunnerConfig;
use crate::error::{Result, TaskmillError};
use crate::pool::{panic_message, SafeExecutor, WorkerPool};
use crate::task::{
    StopReason, TaskContext, TaskCore, TaskDef, TaskHandle, TaskObserver, TaskSpec, TaskStatus,
};

/// Value snapshot of a task, used for the todo listing and the bounded done
/// history. Plain data: holding one retains nothing of the task itself.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub dedup_key: String,
    pub status: TaskStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub queue_time_ms: u64,
    pub running_time_ms: u64,
    pub error: Option<String>,
}

impl TaskRecord {
    fn from_core(core: &TaskCore) -> Self {
        Self {
            id: core.id,
            name: core.name.clone(),
            dedup_key: core.dedup_key.clone(),
            status: core.status(),
            queued_at: core.queued_at(),
            started_at: core.started_at(),
            ended_at: core.ended_at(),
            queue_time_ms: core.queue_time().as_millis() as u64,
            running_time_ms: core.running_time().as_millis() as u64,
            error: core.error().map(|e| format!("{e:#}")),
        }
    }
}

/// Counters kept when the runner is built with `stats = true`.
#[derive(Debug, Default)]
struct RunnerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    queue_ms_total: AtomicU64,
    run_ms_total: AtomicU64,
}

/// Point-in-time view of the runner's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub mean_queue_ms: f64,
    pub mean_run_ms: f64,
}

/// On-disk envelope for `flush_to_disk` / `load`. Best effort; the format is
/// not meant to be stable across versions.
#[derive(Debug, Serialize, Deserialize)]
struct DumpFile {
    saved_at: DateTime<Utc>,
    runner: String,
    tasks: Vec<TaskSpec>,
}

/// Reminder sent through the runner's delay actor when a task has a max
/// runtime. Holds only a weak reference: a finished task costs nothing.
#[derive(Clone)]
struct TimeoutCheck {
    core: Weak<TaskCore>,
}

struct RunnerInner {
    name: String,
    id: Uuid,
    config: RunnerConfig,
    pool: SafeExecutor,
    /// Waiting and running tasks, keyed by dedup key.
    todo: DashMap<String, Arc<TaskCore>>,
    /// Bounded history of finished tasks, oldest evicted first.
    done: Mutex<VecDeque<TaskRecord>>,
    stats: Option<RunnerStats>,
    watchdog: SlowActor<TimeoutCheck>,
    shutdown: AtomicBool,
}

/// Retirement is routed through [`TaskCore::notify_retired`], whose gate
/// guarantees this runs once per task however it reached a terminal state.
impl TaskObserver for RunnerInner {
    fn task_retired(&self, core: &Arc<TaskCore>) {
        self.task_done(core);
    }
}

impl RunnerInner {
    /// Move a finished task from todo into the done history and update the
    /// counters.
    fn task_done(&self, core: &Arc<TaskCore>) {
        self.todo
            .remove_if(&core.dedup_key, |_, current| Arc::ptr_eq(current, core));
        let record = TaskRecord::from_core(core);
        if let Some(stats) = &self.stats {
            match record.status {
                TaskStatus::Done => stats.completed.fetch_add(1, Ordering::Relaxed),
                TaskStatus::Error => stats.failed.fetch_add(1, Ordering::Relaxed),
                _ => stats.cancelled.fetch_add(1, Ordering::Relaxed),
            };
            stats
                .queue_ms_total
                .fetch_add(record.queue_time_ms, Ordering::Relaxed);
            stats
                .run_ms_total
                .fetch_add(record.running_time_ms, Ordering::Relaxed);
            info!(
                runner = %self.name,
                task = %record.name,
                status = %record.status,
                queue_ms = record.queue_time_ms,
                run_ms = record.running_time_ms,
                "task finished"
            );
        }
        let mut done = self.done.lock();
        done.push_back(record);
        while done.len() > self.config.history {
            done.pop_front();
        }
    }

    /// Error sink for task failures. The failure also stays on the handle.
    fn report(&self, core: &TaskCore, error: &anyhow::Error) {
        error!(
            runner = %self.name,
            task = %core.name,
            error = %format!("{error:#}"),
            "task failed"
        );
    }
}

/// A bounded worker-pool task runner with lifecycle tracking,
/// de-duplication, cooperative timeouts/cancellation and a small history of
/// finished tasks.
///
/// Cloning is cheap; clones share the same runner. There is no process-wide
/// default instance: construct one and pass it around.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    /// A runner named `name` backed by `threads` worker threads, with
    /// default history and no stats. Fails when the worker threads cannot
    /// be spawned.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        Self::with_config(
            name,
            RunnerConfig {
                threads,
                ..RunnerConfig::default()
            },
        )
    }

    pub fn with_config(name: &str, config: RunnerConfig) -> Result<Self> {
        let pool = SafeExecutor::new(WorkerPool::new(name, config.threads)?);
        let watchdog = SlowActor::new(&format!("{name}-timeouts"), timeout_check_handler());
        Ok(Self {
            inner: Arc::new(RunnerInner {
                name: name.to_string(),
                id: Uuid::new_v4(),
                pool,
                todo: DashMap::new(),
                done: Mutex::new(VecDeque::with_capacity(config.history + 1)),
                stats: config.stats.then(RunnerStats::default),
                watchdog,
                shutdown: AtomicBool::new(false),
                config,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Submit a task for processing.
    ///
    /// Fails with [`TaskmillError::DuplicateTask`] if a task with an equal
    /// dedup key is already waiting or running, and with
    /// [`TaskmillError::Shutdown`] once the runner is shut down.
    pub fn submit<V: Send + 'static>(&self, def: TaskDef<V>) -> Result<TaskHandle<V>> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TaskmillError::Shutdown);
        }
        let TaskDef {
            name,
            dedup_key,
            max_runtime,
            spec,
            work,
            cleanup,
        } = def;
        let core = Arc::new(TaskCore::new(name, dedup_key, max_runtime, spec));
        core.set_observer(Arc::downgrade(
            &(self.inner.clone() as Arc<dyn TaskObserver>),
        ));

        // Atomic insert-if-absent is the duplicate check: a racing equal
        // submission loses here, not after both are queued.
        match self.inner.todo.entry(core.dedup_key.clone()) {
            Entry::Occupied(_) => {
                return Err(TaskmillError::DuplicateTask(core.dedup_key.clone()));
            }
            Entry::Vacant(vacant) => {
                core.advance(TaskStatus::Waiting);
                core.mark_queued();
                vacant.insert(Arc::clone(&core));
            }
        }
        if let Some(stats) = &self.inner.stats {
            stats.submitted.fetch_add(1, Ordering::Relaxed);
        }

        let output: Arc<Mutex<Option<V>>> = Arc::new(Mutex::new(None));
        let job_inner = Arc::clone(&self.inner);
        let job_core = Arc::clone(&core);
        let job_output = Arc::clone(&output);
        let submitted = self.inner.pool.execute(Box::new(move || {
            run_task(&job_inner, &job_core, &job_output, work, cleanup);
        }));
        if let Err(e) = submitted {
            // Roll back the reservation so a later resubmission can work.
            self.inner
                .todo
                .remove_if(&core.dedup_key, |_, current| Arc::ptr_eq(current, &core));
            return Err(e);
        }
        debug!(runner = %self.inner.name, task = %core.name, "task submitted");
        Ok(TaskHandle::new(core, output))
    }

    /// Non-throwing duplicate variant of [`Self::submit`]: `Ok(None)` when
    /// an equivalent task is already queued or running.
    pub fn submit_if_absent<V: Send + 'static>(
        &self,
        def: TaskDef<V>,
    ) -> Result<Option<TaskHandle<V>>> {
        match self.submit(def) {
            Ok(handle) => Ok(Some(handle)),
            Err(TaskmillError::DuplicateTask(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Is a task with this dedup key waiting or running?
    pub fn has_task(&self, dedup_key: &str) -> bool {
        self.inner.todo.contains_key(dedup_key)
    }

    /// Number of waiting plus running tasks.
    pub fn queue_size(&self) -> usize {
        self.inner.todo.len()
    }

    /// Snapshots of the waiting and running tasks.
    pub fn todo(&self) -> Vec<TaskRecord> {
        self.inner
            .todo
            .iter()
            .map(|entry| TaskRecord::from_core(entry.value()))
            .collect()
    }

    /// The most recently finished tasks, oldest first, at most the
    /// configured history size (default 6). Includes cancelled and errored
    /// tasks.
    pub fn done(&self) -> Vec<TaskRecord> {
        self.inner.done.lock().iter().cloned().collect()
    }

    /// A waiting, running or recently-finished task with this dedup key.
    pub fn find_task(&self, dedup_key: &str) -> Option<TaskRecord> {
        if let Some(core) = self.inner.todo.get(dedup_key) {
            return Some(TaskRecord::from_core(core.value()));
        }
        self.inner
            .done
            .lock()
            .iter()
            .rev()
            .find(|r| r.dedup_key == dedup_key)
            .cloned()
    }

    /// Drop a task from the todo/done bookkeeping without touching the task
    /// itself. Returns true if anything was removed.
    pub fn forget(&self, dedup_key: &str) -> bool {
        let mut removed = self.inner.todo.remove(dedup_key).is_some();
        let mut done = self.inner.done.lock();
        if let Some(pos) = done.iter().position(|r| r.dedup_key == dedup_key) {
            done.remove(pos);
            removed = true;
        }
        removed
    }

    pub fn stats_snapshot(&self) -> Option<StatsSnapshot> {
        let stats = self.inner.stats.as_ref()?;
        let finished = stats.completed.load(Ordering::Relaxed)
            + stats.failed.load(Ordering::Relaxed)
            + stats.cancelled.load(Ordering::Relaxed);
        let mean = |total: u64| {
            if finished == 0 {
                0.0
            } else {
                total as f64 / finished as f64
            }
        };
        Some(StatsSnapshot {
            submitted: stats.submitted.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            mean_queue_ms: mean(stats.queue_ms_total.load(Ordering::Relaxed)),
            mean_run_ms: mean(stats.run_ms_total.load(Ordering::Relaxed)),
        })
    }

    /// Stop accepting work and let the queued tasks drain.
    /// Usually followed by [`Self::await_termination`].
    pub fn shutdown(&self) {
        info!(runner = %self.inner.name, "shutdown");
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.pool.shutdown();
    }

    /// Stop accepting work, cancel every waiting task and ask running ones
    /// to stop cooperatively. Returns the records of tasks that never
    /// started. Best effort: work that ignores its stop token keeps going.
    pub fn shutdown_now(&self) -> Vec<TaskRecord> {
        info!(runner = %self.inner.name, "shutdown now");
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.pool.shutdown_now();
        let mut never_ran = Vec::new();
        let waiting: Vec<Arc<TaskCore>> = self
            .inner
            .todo
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for core in waiting {
            let status = core.status();
            if status < TaskStatus::Running {
                core.cancel.request(StopReason::Cancelled);
                core.advance(TaskStatus::Cancelled);
                core.mark_ended();
                if core.mark_closed() {
                    core.notify_retired();
                    never_ran.push(TaskRecord::from_core(&core));
                }
            } else if status.is_active() {
                core.cancel.request(StopReason::Cancelled);
                core.advance(TaskStatus::Stopping);
            }
        }
        never_ran
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Block until the pool has drained and every worker exited, or the
    /// timeout elapses. Returns true on a clean drain.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let drained = self.inner.pool.await_termination(timeout);
        self.inner.watchdog.please_stop();
        drained
    }

    /// Shut down, wait up to `grace` for in-flight work, then serialize the
    /// specs of the remaining todo list to the configured dump path.
    /// Returns how many were saved. Tasks without a spec are skipped with a
    /// warning.
    pub fn flush_to_disk(&self, grace: Duration) -> Result<usize> {
        let Some(path) = self.inner.config.dump_path.clone() else {
            return Err(TaskmillError::Configuration(
                "no dump path configured".to_string(),
            ));
        };
        self.shutdown();
        if !self.await_termination(grace) {
            warn!(runner = %self.inner.name, "pool did not drain within grace period");
        }
        let mut specs = Vec::new();
        for entry in self.inner.todo.iter() {
            match &entry.value().spec {
                Some(spec) => specs.push(spec.clone()),
                None => warn!(
                    runner = %self.inner.name,
                    task = %entry.value().name,
                    "task has no spec, not dumped"
                ),
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dump = DumpFile {
            saved_at: Utc::now(),
            runner: self.inner.name.clone(),
            tasks: specs,
        };
        serde_json::to_writer_pretty(File::create(&path)?, &dump)?;
        info!(
            runner = %self.inner.name,
            saved = dump.tasks.len(),
            path = %path.display(),
            "saved pending tasks"
        );
        Ok(dump.tasks.len())
    }

    /// Reload a dump written by [`Self::flush_to_disk`], rebuilding each
    /// spec into a task via `rebuild` and resubmitting it. Duplicates
    /// already queued and specs `rebuild` declines are skipped. Returns how
    /// many were resubmitted.
    pub fn load<V, F>(&self, mut rebuild: F) -> Result<usize>
    where
        V: Send + 'static,
        F: FnMut(&TaskSpec) -> Option<TaskDef<V>>,
    {
        let Some(path) = self.inner.config.dump_path.clone() else {
            return Err(TaskmillError::Configuration(
                "no dump path configured".to_string(),
            ));
        };
        if !path.is_file() {
            info!(runner = %self.inner.name, "nothing to load");
            return Ok(0);
        }
        let dump: DumpFile = serde_json::from_reader(File::open(&path)?)?;
        let mut resubmitted = 0;
        for spec in &dump.tasks {
            let Some(def) = rebuild(spec) else {
                warn!(runner = %self.inner.name, kind = %spec.kind, "no rebuilder for spec, skipped");
                continue;
            };
            if self.submit_if_absent(def)?.is_some() {
                resubmitted += 1;
            }
        }
        info!(
            runner = %self.inner.name,
            loaded = resubmitted,
            path = %path.display(),
            "loaded pending tasks from dump"
        );
        Ok(resubmitted)
    }
}

fn timeout_check_handler() -> impl FnMut(TimeoutCheck, Option<&str>) -> anyhow::Result<()> {
    move |check: TimeoutCheck, _from: Option<&str>| {
        if let Some(core) = check.core.upgrade() {
            if core.status().is_active() {
                warn!(task = %core.name, "task exceeded its max runtime, requesting stop");
                core.cancel.request(StopReason::TimedOut);
                core.advance(TaskStatus::Stopping);
            }
        }
        Ok(())
    }
}

/// The once-per-task execution wrapper: timing, timeout arming, span-scoped
/// diagnostics, status transitions and the idempotent close.
fn run_task<V: Send + 'static>(
    inner: &Arc<RunnerInner>,
    core: &Arc<TaskCore>,
    output: &Arc<Mutex<Option<V>>>,
    work: Box<dyn FnOnce(&TaskContext) -> anyhow::Result<V> + Send>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
) {
    if core.status().is_finished() {
        // cancelled while waiting: skip over instead of running
        core.mark_ended();
        close_task(core, cleanup);
        return;
    }
    core.advance(TaskStatus::Running);
    core.mark_started();
    if let Some(max) = core.max_runtime {
        let check = TimeoutCheck {
            core: Arc::downgrade(core),
        };
        if let Err(e) = inner.watchdog.send_delayed(check, max) {
            warn!(task = %core.name, error = %e, "could not arm task timeout");
        }
    }

    // The span carries the task name on every event the work emits, the way
    // a renamed worker thread used to.
    let span = info_span!("task", name = %core.name, id = %core.id);
    let guard = span.enter();
    let ctx = TaskContext::new(core.cancel.clone());
    let outcome = catch_unwind(AssertUnwindSafe(|| (work)(&ctx)));
    drop(guard);
    core.mark_ended();

    match outcome {
        Ok(Ok(value)) => {
            *output.lock() = Some(value);
            core.advance(TaskStatus::Done);
        }
        Ok(Err(e)) => {
            if core.cancel.reason() == Some(StopReason::Cancelled) {
                core.advance(TaskStatus::Cancelled);
            } else {
                // plain failure, or a timeout surfacing through checkpoint()
                inner.report(core, &e);
                core.set_error(e);
                core.advance(TaskStatus::Error);
            }
        }
        Err(panic) => {
            let e = anyhow::anyhow!("task panicked: {}", panic_message(&*panic));
            inner.report(core, &e);
            core.set_error(e);
            core.advance(TaskStatus::Error);
        }
    }
    close_task(core, cleanup);
}

/// Idempotent: runs the cleanup hook (its failure is logged, never
/// propagated) and tells the runner the task is finished.
fn close_task(core: &Arc<TaskCore>, cleanup: Option<Box<dyn FnOnce() + Send>>) {
    if !core.mark_closed() {
        return;
    }
    if let Some(cleanup) = cleanup {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(cleanup)) {
            error!(
                task = %core.name,
                panic = %panic_message(&*panic),
                "task cleanup failed"
            );
        }
    }
    core.notify_retired();
}
