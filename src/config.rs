//! # Configuration
//!
//! Explicit, validated configuration for the toolkit's components. All
//! settings have sensible defaults; a TOML file and `TASKMILL_*` environment
//! variables can override them. There are no hidden singletons — construct a
//! config, hand it to the component that needs it.
//!
//! ```rust,no_run
//! use taskmill::config::TaskmillConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TaskmillConfig::load()?;
//! println!("runner threads: {}", config.runner.threads);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskmillError};

/// Root configuration for the toolkit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskmillConfig {
    /// Task runner / worker pool settings
    pub runner: RunnerConfig,

    /// Actor mailbox settings
    pub actor: ActorConfig,

    /// Named lock registry settings
    pub lock: LockConfig,
}

/// Settings for a [`crate::runner::TaskRunner`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker threads backing the pool.
    pub threads: usize,

    /// How many finished tasks to keep around for inspection.
    pub history: usize,

    /// Track per-runner counters and timing means.
    pub stats: bool,

    /// Where `flush_to_disk` writes the pending-task dump.
    pub dump_path: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            history: 6,
            stats: false,
            dump_path: None,
        }
    }
}

/// Settings for [`crate::actor::Actor`] mailboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Maximum mailbox length. Unset means unbounded. When set, `send`
    /// fails synchronously once the limit is reached.
    pub max_queue: Option<usize>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self { max_queue: None }
    }
}

/// Settings for the [`crate::lock::LockRegistry`] blocking-acquire wait loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// First wait interval when a lock is contended.
    pub initial_backoff_ms: u64,

    /// Ceiling for the doubling wait interval.
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 4,
            max_backoff_ms: 10_000,
        }
    }
}

impl LockConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl TaskmillConfig {
    /// Load configuration from `taskmill.toml` (if present) plus
    /// `TASKMILL_*` environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit file plus environment overrides.
    ///
    /// Environment variables use `__` as the section separator, e.g.
    /// `TASKMILL_RUNNER__THREADS=8`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p)),
            None => builder.add_source(config::File::with_name("taskmill").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("TASKMILL")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| TaskmillError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| TaskmillError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TaskmillConfig::default();
        assert_eq!(config.runner.threads, 2);
        assert_eq!(config.runner.history, 6);
        assert!(!config.runner.stats);
        assert!(config.runner.dump_path.is_none());
        assert!(config.actor.max_queue.is_none());
        assert_eq!(config.lock.initial_backoff(), Duration::from_millis(4));
        assert_eq!(config.lock.max_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[runner]\nthreads = 8\nstats = true\n\n[lock]\ninitial_backoff_ms = 2"
        )
        .unwrap();

        let config = TaskmillConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.runner.threads, 8);
        assert!(config.runner.stats);
        // untouched sections keep their defaults
        assert_eq!(config.runner.history, 6);
        assert_eq!(config.lock.initial_backoff_ms, 2);
        assert_eq!(config.lock.max_backoff_ms, 10_000);
    }
}
