//! Logging module for proxycore.
//!
//! Structured logging on top of `tracing`: a registry with an env filter, an
//! optional stdout sink and an optional daily-rolling file sink, either of
//! which may emit JSON. Records from the `log` facade are bridged in.

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stdout (default: true)
    pub log_to_stdout: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: PathBuf,

    /// Base filename for log files (default: "proxycore")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: true)
    pub include_file_line: bool,

    /// Whether to emit span open/close events (default: false)
    pub include_span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stdout: true,
            log_to_file: false,
            log_dir: PathBuf::from("./logs"),
            log_file_name: "proxycore".to_string(),
            json_format: false,
            include_file_line: true,
            include_span_events: false,
        }
    }
}

impl LogOptions {
    /// Options derived from the `log_level` and `[logging]` configuration.
    pub fn from_config(config: &crate::config::Config) -> Self {
        LogOptions {
            level: parse_level(&config.log_level).unwrap_or(Level::INFO),
            log_to_stdout: config.logging.stdout,
            log_to_file: config.logging.file,
            log_dir: config.logging.dir.clone(),
            json_format: config.logging.json,
            ..Default::default()
        }
    }
}

/// Parse a level name such as `"debug"`, case-insensitively.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(options: &LogOptions, writer: W) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if options.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_file(options.include_file_line)
        .with_line_number(options.include_file_line)
        .with_target(true)
        .with_span_events(span_events)
        .with_writer(writer);

    if options.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Initialize logging with the given options.
///
/// Returns the file writer's guard when file logging is enabled; keep it
/// alive for the life of the process so buffered records are flushed.
///
/// # Examples
///
/// ```
/// use shared_utils::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let _guard = init_logging(LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// });
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let filter = EnvFilter::builder()
        .with_default_directive(options.level.into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if options.log_to_stdout {
        layers.push(format_layer(&options, std::io::stdout));
    }

    if options.log_to_file {
        let appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);
        let (writer, worker_guard) = NonBlocking::new(appender);
        guard = Some(worker_guard);
        layers.push(format_layer(&options, writer));
    }

    // Another subscriber may already be installed in this process
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();

    guard
}

/// Initialize logging from a configuration.
pub fn init_logging_from_config(config: &crate::config::Config) -> Option<WorkerGuard> {
    init_logging(LogOptions::from_config(config))
}
