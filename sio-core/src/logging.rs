//! Log output for embedding applications.
//!
//! The client crates only emit `tracing` events. An application that wants
//! them on disk calls [`init_from_config`] once at startup; one that only
//! wants them on the terminal calls [`init_console_logging`].

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ClientConfig, LoggingConfig};
use crate::error::{SioError, SioResult};

/// Prefix of the daily log files; the date is appended on rotation.
pub const LOG_FILE_PREFIX: &str = "sio-client.log";

/// Keeps the background log writer running. Dropping it flushes pending lines.
pub struct LogGuard {
    _writer: WorkerGuard,
}

/// Install the global subscriber described by `config.logging`, writing
/// into [`ClientConfig::effective_log_dir`] and mirroring to stderr.
///
/// Fails with [`SioError::Config`] when a global subscriber already exists.
pub fn init_from_config(config: &ClientConfig) -> SioResult<LogGuard> {
    let dir = config.effective_log_dir()?;
    let (subscriber, guard) = file_subscriber(&config.logging, &dir)?;
    subscriber
        .try_init()
        .map_err(|e| SioError::Config(format!("a log subscriber is already installed: {e}")))?;

    tracing::info!(
        level = %config.logging.level,
        dir = %dir.display(),
        json = config.logging.json_output,
        "file logging started"
    );
    Ok(guard)
}

/// Build, without installing, a subscriber that writes daily-rotated files
/// under `dir` and compact lines to stderr.
pub fn file_subscriber(
    settings: &LoggingConfig,
    dir: &Path,
) -> SioResult<(impl Subscriber + Send + Sync + 'static, LogGuard)> {
    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));

    let plain = (!settings.json_output).then(|| {
        fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
    });
    let json = settings.json_output.then(|| {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let subscriber = tracing_subscriber::registry()
        .with(level_filter(&settings.level))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true).compact())
        .with(plain)
        .with(json);
    Ok((subscriber, LogGuard { _writer: guard }))
}

/// Unparsable directives fall back to `info`.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console-only logging for tests and quick experiments.
///
/// Subsequent calls are no-ops.
pub fn init_console_logging(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(level_filter(level))
        .with(fmt::layer().with_target(true).compact())
        .try_init();
}
