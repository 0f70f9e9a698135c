//! `tracing` subscriber setup.
//!
//! Console output is always human-readable. With a log directory a second
//! layer writes daily-rotated files, optionally as JSON lines. `RUST_LOG`
//! overrides the configured level.

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LogSettings<'a> {
    /// Default filter when `RUST_LOG` is unset (e.g. `"info"`, `"mx_sync=debug"`).
    pub level: &'a str,
    /// Directory for rotated log files. `None` logs to the console only.
    pub dir: Option<&'a str>,
    /// Log file prefix (e.g. `"mx-runner"`).
    pub file_prefix: &'a str,
    /// Write the file layer as JSON lines.
    pub json: bool,
}

impl<'a> LogSettings<'a> {
    /// Console-only logging at `level`.
    pub fn console(level: &'a str) -> Self {
        Self {
            level,
            dir: None,
            file_prefix: "mx",
            json: false,
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. A second call only prints a notice.
pub fn init_logging(settings: &LogSettings<'_>) {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(true);

    let file_layer = settings.dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, settings.file_prefix);
        let layer = fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true);
        if settings.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    });

    let result = tracing_subscriber::registry()
        .with(env_filter(settings.level))
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
