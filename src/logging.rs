//! Logging setup using `tracing` and `tracing-subscriber`.
//!
//! Priority for the log level:
//! 1. `--log-level` CLI flag
//! 2. `PLAYRUN_LOG` environment variable (e.g. "info", "debug")
//! 3. `warn`
//!
//! Diagnostics go to stderr so playbook output on stdout stays clean.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt;

/// Environment variable consulted when no CLI level is given.
pub const LOG_ENV: &str = "PLAYRUN_LOG";

/// Failure installing the global subscriber.
#[derive(Debug, Error)]
#[error("failed to install log subscriber: {0}")]
pub struct LoggingError(String);

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] when a subscriber is already installed.
pub fn init_logging(cli_level: Option<Level>) -> Result<(), LoggingError> {
    let level = cli_level
        .or_else(|| {
            std::env::var(LOG_ENV)
                .ok()
                .and_then(|raw| parse_level_str(&raw))
        })
        .unwrap_or(Level::WARN);

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| LoggingError(err.to_string()))
}

/// Parses a level name, accepting `warning` as an alias.
#[must_use]
pub fn parse_level_str(raw: &str) -> Option<Level> {
    match raw.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
