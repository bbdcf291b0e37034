//! Structured Logging with Tracing

use crate::{Result, TelemetryError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log levels compatible with tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    #[must_use]
    pub const fn to_tracing_level(&self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Trace => "trace",
                Self::Debug => "debug",
                Self::Info => "info",
                Self::Warn => "warn",
                Self::Error => "error",
            }
        )
    }
}

impl FromStr for LogLevel {
    type Err = TelemetryError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(TelemetryError::Logging(format!("Invalid log level: {s}"))),
        }
    }
}

/// Output format for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Multi-line human-readable output
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(TelemetryError::Logging(format!("Invalid log format: {s}"))),
        }
    }
}

/// Output destination for logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Append to a file, creating missing parent directories
    File(PathBuf),
    /// Append to a file and optionally mirror to stdout
    Both { stdout: bool, file: PathBuf },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum log level, overridden by `RUST_LOG` when set
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Extra filter directives such as `xfer_sched::placement=debug`
    pub directives: Vec<String>,
    /// Whether to include the target module path in logs
    pub include_target: bool,
    /// Whether to include file name and line number in logs
    pub include_file_line: bool,
    pub include_thread_id: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
            directives: Vec::new(),
            include_target: true,
            include_file_line: false,
            include_thread_id: false,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub const fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }
}

/// Build the event filter for a configuration
///
/// `RUST_LOG` wins over the configured level; configured directives are
/// added on top of either.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    for directive in &config.directives {
        let parsed = directive
            .parse()
            .map_err(|e| TelemetryError::Logging(format!("Invalid directive {directive}: {e}")))?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// Install the global subscriber
///
/// Fails with [`TelemetryError::Init`] when a subscriber is already set.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config)?;

    match &config.output {
        LogOutput::Stdout => apply_fmt(config, std::io::stdout, filter),
        LogOutput::Stderr => apply_fmt(config, std::io::stderr, filter),
        LogOutput::File(path) => {
            let file = open_log_file(path)?;
            apply_fmt(config, Arc::new(file), filter)
        }
        LogOutput::Both { stdout, file } => {
            let file = open_log_file(file)?;
            if *stdout {
                let combined = CombinedWriter {
                    stdout: Arc::new(Mutex::new(std::io::stdout())),
                    file: Arc::new(Mutex::new(file)),
                };
                apply_fmt(config, combined, filter)
            } else {
                apply_fmt(config, Arc::new(file), filter)
            }
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

#[derive(Clone)]
struct CombinedWriter {
    stdout: Arc<Mutex<std::io::Stdout>>,
    file: Arc<Mutex<File>>,
}

impl Write for CombinedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stdout.lock().write_all(buf)?;
        self.file.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stdout.lock().flush()?;
        self.file.lock().flush()?;
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CombinedWriter {
    type Writer = Self;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn apply_fmt<W>(config: &LogConfig, writer: W, filter: EnvFilter) -> Result<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let init_result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_file(config.include_file_line)
            .with_line_number(config.include_file_line)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_file(config.include_file_line)
            .with_line_number(config.include_file_line)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_file(config.include_file_line)
            .with_line_number(config.include_file_line)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
    };
    init_result.map_err(|e| TelemetryError::Init(format!("Failed to init subscriber: {e}")))
}
