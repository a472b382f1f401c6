//! Log output for hosts embedding the library.
//!
//! The library itself only emits `tracing` events. A host that wants them on
//! the terminal and in rotated JSON files calls [`init`] once at startup and
//! holds on to the returned [`LoggingGuard`] until shutdown.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{Directive, EnvFilter, ParseError};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Target of every event this crate emits.
const CRATE_TARGET: &str = "offtrack_core";
/// Level applied to every other crate.
const OTHER_CRATES: &str = "warn";
const FILE_PREFIX: &str = "offtrack";
const FILE_SUFFIX: &str = "log";

/// How much of the library's activity is logged.
///
/// The console gets one step less than the log files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Problems only on the console; commits and deletions in files.
    Quiet,
    /// Commits, deletions and rescans on the console; decisions in files.
    #[default]
    Normal,
    /// Every decision on the console; everything in files.
    Verbose,
    /// Everything everywhere.
    Trace,
}

impl Verbosity {
    const fn console_level(self) -> Level {
        match self {
            Self::Quiet => Level::WARN,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    const fn file_level(self) -> Level {
        match self {
            Self::Quiet => Level::INFO,
            Self::Normal => Level::DEBUG,
            Self::Verbose | Self::Trace => Level::TRACE,
        }
    }
}

/// When a new log file is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    /// `offtrack.<date>-<hour>.log`
    Hourly,
    /// `offtrack.<date>.log`
    #[default]
    Daily,
    /// A single `offtrack.log`.
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for JSON log files. `None` logs to the console only.
    pub directory: Option<PathBuf>,
    /// Amount of detail.
    pub verbosity: Verbosity,
    /// File rotation.
    pub rotation: LogRotation,
    /// Rotated files kept on disk.
    pub retained_files: usize,
    /// Colored console output.
    pub ansi: bool,
    /// Source file and line on console lines, plus span open/close events.
    pub source_locations: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl LoggingConfig {
    /// Normal verbosity with a week of daily files.
    #[must_use]
    pub fn production() -> Self {
        Self {
            directory: Some(default_log_directory()),
            verbosity: Verbosity::Normal,
            rotation: LogRotation::Daily,
            retained_files: 7,
            ansi: true,
            source_locations: false,
        }
    }

    /// Verbose output with source locations and a day of hourly files.
    #[must_use]
    pub fn development() -> Self {
        Self {
            verbosity: Verbosity::Verbose,
            rotation: LogRotation::Hourly,
            retained_files: 24,
            source_locations: true,
            ..Self::production()
        }
    }

    /// [`development`](Self::development) in debug builds, otherwise
    /// [`production`](Self::production).
    #[must_use]
    pub fn auto() -> Self {
        if cfg!(debug_assertions) {
            Self::development()
        } else {
            Self::production()
        }
    }

    /// Write files to `directory`.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Log to the console only.
    #[must_use]
    pub fn console_only(mut self) -> Self {
        self.directory = None;
        self
    }

    /// Set the verbosity.
    #[must_use]
    pub const fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set the rotation.
    #[must_use]
    pub const fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }
}

/// Flushes buffered file output when dropped.
pub struct LoggingGuard {
    file: Option<WorkerGuard>,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard")
            .field("file", &self.file.is_some())
            .finish()
    }
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` replaces the console filter when set. Log files always record
/// this crate at the configured file level, as JSON.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| crate_filter(config.verbosity.console_level()))?;
    let span_events = if config.source_locations {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let console = fmt::layer()
        .with_ansi(config.ansi)
        .with_target(config.source_locations)
        .with_file(config.source_locations)
        .with_line_number(config.source_locations)
        .with_span_events(span_events)
        .with_filter(console_filter);

    let (file, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|e| LoggingError::Directory {
                path: directory.clone(),
                reason: e.to_string(),
            })?;
            let appender = RollingFileAppender::builder()
                .rotation(config.rotation.into())
                .filename_prefix(FILE_PREFIX)
                .filename_suffix(FILE_SUFFIX)
                .max_log_files(config.retained_files.max(1))
                .build(directory)
                .map_err(|e| LoggingError::Appender(e.to_string()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(crate_filter(config.verbosity.file_level())?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard { file: guard })
}

/// [`init`] with [`LoggingConfig::auto`].
pub fn init_auto() -> Result<LoggingGuard, LoggingError> {
    init(&LoggingConfig::auto())
}

/// `<data_local_dir>/offtrack/logs`.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("offtrack")
        .join("logs")
}

/// Other crates at `warn`, this one at `level`.
fn crate_filter(level: Level) -> Result<EnvFilter, LoggingError> {
    Ok(EnvFilter::new(OTHER_CRATES).add_directive(crate_directive(level)?))
}

fn crate_directive(level: Level) -> Result<Directive, LoggingError> {
    let raw = format!("{CRATE_TARGET}={}", level.as_str().to_lowercase());
    raw.parse().map_err(|e: ParseError| LoggingError::Directive {
        directive: raw.clone(),
        reason: e.to_string(),
    })
}

/// Failure to set up logging.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("Cannot create log directory {path}: {reason}")]
    Directory {
        /// Directory.
        path: PathBuf,
        /// OS message.
        reason: String,
    },

    /// The rolling file writer could not be opened.
    #[error("Cannot open log file: {0}")]
    Appender(String),

    /// A filter directive did not parse.
    #[error("Invalid log filter {directive}: {reason}")]
    Directive {
        /// Directive text.
        directive: String,
        /// Parser message.
        reason: String,
    },

    /// Another global subscriber is installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}
