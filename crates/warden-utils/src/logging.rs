//! # Logging
//!
//! One `tracing` subscriber for every Warden binary: a console layer on
//! stderr and, optionally, a non-blocking file layer. Both share the
//! format and the filter.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (`debug`, `warden_core::process=trace`);
//!   defaults to `info`
//! - `WARDEN_LOG_FORMAT`: `pretty` (alias `dev`) or `json` (alias `prod`)
//! - `WARDEN_LOG_FILE`: also log to this file, rotated daily. A directory
//!   gets one `YYYY-MM-DD-warden.log` file per run day instead.
//!
//! ## Example
//!
//! ```rust,no_run
//! let _guard = warden_utils::init_logging().expect("Failed to initialize logging");
//! tracing::info!(pid = 4242, "attached");
//! ```
//!
//! Keep the returned [`LoggingGuard`] alive: dropping it flushes and stops
//! the file writer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Selects the output format
pub const FORMAT_VAR: &str = "WARDEN_LOG_FORMAT";
/// Names the optional log file or directory
pub const FILE_VAR: &str = "WARDEN_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// What [`init_logging_with`] sets up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig
{
    pub format: LogFormat,
    /// Fixed level; `None` defers to `RUST_LOG`
    pub level: Option<LogLevel>,
    /// File or directory to log into as well
    pub file: Option<PathBuf>,
}

impl LogConfig
{
    /// Configuration from `WARDEN_LOG_FORMAT` and `WARDEN_LOG_FILE`.
    ///
    /// ## Errors
    ///
    /// [`LoggingError::InvalidFormat`] for an unknown format name.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match std::env::var(FORMAT_VAR) {
            Ok(raw) => raw.parse().map_err(LoggingError::InvalidFormat)?,
            Err(_) => LogFormat::default(),
        };
        let file = std::env::var_os(FILE_VAR)
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);
        Ok(Self {
            format,
            level: None,
            file,
        })
    }

    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    #[must_use]
    pub const fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self
    {
        self.file = Some(file.into());
        self
    }
}

/// Keeps the file writer alive
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    _worker: Option<WorkerGuard>,
    file: Option<PathBuf>,
}

impl LoggingGuard
{
    /// File events are written to, when file logging is on.
    #[must_use]
    pub fn file(&self) -> Option<&Path>
    {
        self.file.as_deref()
    }
}

/// Initialize logging from the environment.
///
/// ## Errors
///
/// Fails on an invalid `WARDEN_LOG_FORMAT`, when the log file cannot be
/// created, or when a global subscriber is already installed.
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_logging_with(&LogConfig::from_env()?)
}

/// Initialize logging from an explicit configuration.
///
/// ## Errors
///
/// See [`init_logging`].
pub fn init_logging_with(config: &LogConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![format_layer(config.format, io::stderr, true, env_filter(config.level))];
    let mut guard = LoggingGuard::default();

    if let Some(path) = &config.file {
        let (appender, resolved) = file_appender(path)?;
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(config.format, writer, false, env_filter(config.level)));
        guard = LoggingGuard {
            _worker: Some(worker),
            file: Some(resolved),
        };
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    Ok(guard)
}

/// An explicit level wins over `RUST_LOG`; `info` when neither is set.
fn env_filter(level: Option<LogLevel>) -> EnvFilter
{
    match level {
        Some(level) => EnvFilter::new(Level::from(level).to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Appender for `path`, and the file the first events land in.
fn file_appender(path: &Path) -> Result<(RollingFileAppender, PathBuf), LoggingError>
{
    if path.is_dir() || path.as_os_str().to_string_lossy().ends_with('/') {
        fs::create_dir_all(path)?;
        let name = format!("{}-warden.log", Utc::now().format("%Y-%m-%d"));
        let resolved = path.join(&name);
        return Ok((rolling::never(path, name), resolved));
    }
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.display().to_string()))?;
    fs::create_dir_all(directory)?;
    Ok((rolling::daily(directory, prefix), path.to_path_buf()))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// The log path names no file
    #[error("Invalid log file: {0}")]
    InvalidFile(String),

    /// A global subscriber was installed already
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("dev").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("err").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_config_builders()
    {
        let config = LogConfig::default()
            .with_format(LogFormat::Json)
            .with_level(LogLevel::Debug)
            .with_file("/tmp/warden.log");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, Some(LogLevel::Debug));
        assert_eq!(config.file.as_deref(), Some(Path::new("/tmp/warden.log")));
    }

    #[test]
    fn test_directory_gets_dated_file()
    {
        let dir = std::env::temp_dir().join(format!("warden-logging-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let (_appender, resolved) = file_appender(&dir).unwrap();
        let name = resolved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-warden.log"), "{name}");
        assert_eq!(resolved.parent(), Some(dir.as_path()));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_path_is_kept()
    {
        let dir = std::env::temp_dir().join(format!("warden-logging-file-{}", std::process::id()));
        let path = dir.join("session.log");
        let (_appender, resolved) = file_appender(&path).unwrap();
        assert_eq!(resolved, path);
        assert!(dir.is_dir());
        fs::remove_dir_all(&dir).unwrap();
    }
}
