//! Logging configuration
//!
//! A node logs to stderr (stdout carries command replies) and optionally to a
//! per-host JSONL file. [`LogConfig::cli`] builds what the `lsnet` binary
//! needs from its flags; [`LogConfig::with_node_file`] adds the file sink.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How events are rendered on stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleOutput {
    /// No console output
    Off,
    /// Human-readable lines
    Pretty { ansi: bool },
    /// One JSON object per event
    Json,
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        ConsoleOutput::Pretty { ansi: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub console: ConsoleOutput,
    /// JSONL file sink
    pub file: Option<FileConfig>,
    /// Add file/line to JSON events
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: ConsoleOutput::default(),
            file: None,
            include_location: false,
        }
    }
}

impl LogConfig {
    /// Configuration for the `lsnet` binary's `--verbose` / `--json-logs` flags
    pub fn cli(verbose: bool, json: bool) -> Self {
        Self {
            level: if verbose { "debug" } else { "info" }.to_string(),
            console: if json {
                ConsoleOutput::Json
            } else {
                ConsoleOutput::Pretty { ansi: true }
            },
            ..Self::default()
        }
    }

    /// Also write daily-rotated JSONL files named after `hostname` into `dir`
    ///
    /// Colors are turned off on the console so that redirected stderr
    /// matches the file contents.
    pub fn with_node_file(mut self, dir: impl Into<PathBuf>, hostname: &str) -> Self {
        if let ConsoleOutput::Pretty { ansi } = &mut self.console {
            *ansi = false;
        }
        self.file = Some(FileConfig {
            directory: dir.into(),
            prefix: format!("lsnet-{hostname}"),
            rotation: RotationStrategy::Daily,
            max_files: Some(7),
        });
        self
    }
}

/// JSONL file sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name prefix; the appender adds the date and `.log`
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Rotated files kept on disk
    pub max_files: Option<usize>,
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One file, truncated on start
    Never,
}
