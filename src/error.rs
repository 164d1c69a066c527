//! Crate-wide error types.
//!
//! Misuse conditions (recursive lock acquisition, duplicate task submission,
//! mailbox overflow) get distinct named variants so callers can tell a
//! programming error from ordinary contention.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskmillError {
    /// Could not obtain the lock within the caller's `max_try` budget.
    /// Contention, not a bug: callers may retry or back off.
    #[error("timed out waiting for lock `{0}`")]
    LockTimeout(String),

    /// The calling thread already holds this lock and did not ask for a
    /// reentrant acquire. The stale lock has been force-released.
    #[error("recursive acquisition of lock `{0}` (reentrant was not requested)")]
    LockRecursion(String),

    /// A task with an equal dedup key is already waiting or running.
    #[error("an equivalent task `{0}` is already queued or running")]
    DuplicateTask(String),

    /// The actor's mailbox is at its configured limit.
    #[error("mailbox for actor `{actor}` is full ({len} pending)")]
    QueueTooLong { actor: String, len: usize },

    /// The runner or pool no longer accepts work.
    #[error("executor is shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("task dump serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskmillError>;
