//! Logging setup for lsnet nodes
//!
//! Wraps `tracing-subscriber` so that the binary (and tests that want log
//! output) configure logging from an explicit [`LogConfig`] value.
//!
//! # Features
//!
//! - **Pretty or JSONL console output**, written to stderr so stdout stays free for command replies
//! - **JSONL file output** with daily/hourly rotation via tracing-appender
//! - **`RUST_LOG` overrides** through `EnvFilter`
//!
//! # Quick Start
//!
//! ```ignore
//! use lsnet_logging::{LogConfig, LsnetSubscriberBuilder};
//!
//! // Keep the guard alive for as long as file output is needed
//! let _guard = LsnetSubscriberBuilder::new()
//!     .with_config(LogConfig::cli(true, false).with_node_file("logs", "n1"))
//!     .init();
//!
//! let span = lsnet_logging::node_span("n1");
//! let _entered = span.enter();
//! tracing::info!("node starting");
//! ```

pub mod config;

pub use config::{ConsoleOutput, FileConfig, LogConfig, RotationStrategy};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to prepare log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create rolling log file: {0}")]
    Appender(#[from] InitError),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Builder for configuring and initializing the lsnet logging subscriber
pub struct LsnetSubscriberBuilder {
    config: LogConfig,
}

impl LsnetSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    ///
    /// Default: pretty output to the console
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the filter used when `RUST_LOG` is unset
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// Choose the console rendering
    pub fn with_console(mut self, console: ConsoleOutput) -> Self {
        self.config.console = console;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Initialize the subscriber globally
    ///
    /// Returns the file writer guard, which must be kept alive for the
    /// duration of the program. Failures are reported on stderr and leave
    /// logging unconfigured.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {}", e);
                None
            }
        }
    }

    /// Try to initialize the subscriber globally
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level));
        let location = self.config.include_location;

        let pretty_console = match self.config.console {
            ConsoleOutput::Pretty { ansi } => Some(
                fmt::layer()
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            ),
            _ => None,
        };

        let json_console = (self.config.console == ConsoleOutput::Json).then(|| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .flatten_event(true)
                .with_file(location)
                .with_line_number(location)
                .with_writer(std::io::stderr)
        });

        let (file_layer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = create_file_writer(file_config)?;
                let layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .flatten_event(true)
                    .with_file(location)
                    .with_line_number(location)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(pretty_console)
            .with(json_console)
            .with(file_layer)
            .try_init()?;

        Ok(guard)
    }
}

impl Default for LsnetSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Never truncates a single file; the others append through a rolling appender
fn create_file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let file = File::create(config.directory.join(format!("{}.log", config.prefix)))?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.clone())
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Span wrapping all work done on behalf of one overlay node
pub fn node_span(hostname: &str) -> tracing::Span {
    tracing::info_span!("node", hostname = %hostname)
}
