//! Tracing subscriber setup for applications embedding the engine.
//!
//! The engine itself only emits `tracing` events. Applications that have no
//! subscriber of their own can install this one: an optional daily-rotating
//! log file plus optional stderr output, filtered by `RUST_LOG` when set and
//! by a [`DebugThreshold`] otherwise.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::DebugThreshold;
use crate::error::{Error, Result};

const LOG_FILE_PREFIX: &str = "fluux-xmlstream.log";

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub threshold: DebugThreshold,
    /// Write a daily-rotating log file.
    pub file: bool,
    /// Directory for the log file, [`default_log_dir`] when unset.
    pub log_dir: Option<PathBuf>,
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            threshold: DebugThreshold::default(),
            file: false,
            log_dir: None,
            stderr: true,
        }
    }
}

/// Platform log directory:
///   Linux:   ~/.local/share/fluux-xmlstream/logs/  (or $XDG_DATA_HOME)
///   macOS:   ~/Library/Application Support/fluux-xmlstream/logs/
///   Windows: %LOCALAPPDATA%\fluux-xmlstream\logs\
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fluux-xmlstream")
        .join("logs")
}

fn filter_directive(threshold: DebugThreshold) -> String {
    format!("fluux_xmlstream={},warn", threshold.level_filter())
}

fn build_filter(threshold: DebugThreshold) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directive(threshold))
    }
}

/// Installs the global subscriber.
///
/// Returns the file writer's guard when file logging is on; dropping it
/// flushes and stops the background writer, so hold it for the program's
/// lifetime. A second installation fails with a configuration error.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = if config.file {
        let log_dir = config.log_dir.clone().unwrap_or_else(default_log_dir);
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            Error::Configuration(format!(
                "could not create log directory '{}': {}",
                log_dir.display(),
                e
            ))
        })?;

        // Daily-rotating log file, non-blocking writes
        let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(build_filter(config.threshold));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let stderr_layer = config.stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(build_filter(config.threshold))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Configuration(format!("failed to install tracing subscriber: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(
            filter_directive(DebugThreshold::Verbose),
            "fluux_xmlstream=trace,warn"
        );
        assert_eq!(
            filter_directive(DebugThreshold::Error),
            "fluux_xmlstream=error,warn"
        );
        assert_eq!(filter_directive(DebugThreshold::None), "fluux_xmlstream=off,warn");
    }

    #[test]
    fn test_default_log_dir() {
        assert!(default_log_dir().ends_with("fluux-xmlstream/logs"));
    }

    #[test]
    fn test_init_twice_is_configuration_error() {
        let log_dir = std::env::temp_dir().join(format!("fluux-xmlstream-logs-{}", std::process::id()));
        let config = LogConfig {
            threshold: DebugThreshold::Debug,
            file: true,
            log_dir: Some(log_dir.clone()),
            stderr: false,
        };

        let guard = init_tracing(&config).unwrap();
        assert!(guard.is_some());
        assert!(log_dir.is_dir());

        let err = init_tracing(&config).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigurationError);

        drop(guard);
        let _ = std::fs::remove_dir_all(&log_dir);
    }
}
