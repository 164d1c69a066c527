//! # Structured Logging
//!
//! Environment-aware tracing setup for binaries and tests. Library code only
//! emits `tracing` events; calling [`init_logging`] is optional and safe to
//! repeat — the first call wins, later calls (and an already-installed global
//! subscriber) are ignored.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console logging with an environment-driven filter.
///
/// The filter comes from `TASKMILL_LOG` when set, otherwise from a default
/// level chosen per `TASKMILL_ENV` (production gets `info`, everything else
/// `debug`).
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_env("TASKMILL_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(&get_environment())));

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_level(true)
                .with_filter(filter),
        );

        // A global subscriber may already be installed by the embedding
        // application; that is fine.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}

fn get_environment() -> String {
    std::env::var("TASKMILL_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}
