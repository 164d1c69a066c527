#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Taskmill
//!
//! An in-process concurrency toolkit for coordinating work across threads:
//! named expiring locks, mailbox actors, and a bounded worker-pool task
//! runner with an explicit lifecycle state machine.
//!
//! ## Components
//!
//! - [`lock`] - named, expiring, reentrant mutual exclusion with orphan
//!   (dead-holder) recovery
//! - [`actor`] - single-threaded mailbox actors, plus a delay-ordered
//!   variant for scheduled delivery
//! - [`task`] / [`runner`] - discrete units of work tracked through
//!   `NOT_SUBMITTED → WAITING → RUNNING → … → {DONE|ERROR|CANCELLED}`,
//!   executed on a bounded pool with de-duplication, cooperative
//!   timeouts/cancellation and a small done history
//! - [`pool`] - the underlying worker pool and its panic-logging decorator
//! - [`expiring`] - a per-entry-TTL map, handy for cooldown tracking
//! - [`config`] / [`logging`] / [`error`] - the usual ambient plumbing
//!
//! ## Design stance
//!
//! Everything here is single-process and in-memory. There are no global
//! singletons: registries and runners are constructed and passed around
//! explicitly. Cancellation is cooperative everywhere — no thread is ever
//! killed. And nothing swallows a failure without at least a log entry.
//!
//! ## Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use taskmill::lock::LockRegistry;
//! use taskmill::runner::TaskRunner;
//! use taskmill::task::TaskDef;
//!
//! # fn main() -> taskmill::Result<()> {
//! let locks = LockRegistry::new();
//! let runner = TaskRunner::new("background", 2)?;
//!
//! let registry = locks.clone();
//! let handle = runner.submit(TaskDef::new("rebuild:index", move |ctx| {
//!     let _guard = registry
//!         .acquire("index", Duration::from_secs(30), Duration::from_secs(5), false)?;
//!     ctx.checkpoint()?;
//!     Ok("rebuilt")
//! }))?;
//!
//! handle.wait(Duration::from_secs(10));
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod config;
pub mod error;
pub mod expiring;
pub mod lock;
pub mod logging;
pub mod pool;
pub mod runner;
pub mod task;

pub use actor::{Actor, MessageHandler, Packet, SlowActor};
pub use config::{ActorConfig, LockConfig, RunnerConfig, TaskmillConfig};
pub use error::{Result, TaskmillError};
pub use expiring::ExpiringMap;
pub use lock::{LockHandle, LockInfo, LockRegistry};
pub use pool::{SafeExecutor, WorkerPool};
pub use runner::{StatsSnapshot, TaskRecord, TaskRunner};
pub use task::{CancelToken, StopReason, TaskContext, TaskDef, TaskHandle, TaskSpec, TaskStatus};
