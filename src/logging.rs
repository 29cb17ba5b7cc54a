//! Tracing subscriber setup.
//!
//! Events go to stderr (text or JSON) and, for commands that drive phases, to
//! a daily-rolling file under `.stagehand/logs/`.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "stagehand.log";

/// Stderr log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `RUST_LOG` if set, otherwise `info` (`debug` when verbose).
pub fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
/// Calling this twice leaves the first subscriber in place.
pub fn init(format: LogFormat, verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let file = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX),
        )),
        Err(e) => {
            eprintln!("warning: cannot create log directory {}: {}", dir.display(), e);
            None
        }
    });
    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(file_layer);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    guard
}
