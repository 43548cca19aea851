//! Line commands read by the `lsnet` binary from stdin

use std::path::PathBuf;

use thiserror::Error;

/// One stdin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `DUMPTABLE <file>`
    DumpTable(PathBuf),
    /// `FORCEUPDATE`
    ForceUpdate,
    /// `CHECKSTABLE`
    CheckStable,
    /// `SNDMSG <dst> <text>`
    SendMessage { destination: String, text: String },
    /// `PING <dst>`
    Ping(String),
    /// `TRACEROUTE <dst>`
    Traceroute(String),
    /// `SHUTDOWN`
    Shutdown,
}

/// Why a command line was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command `{0}`")]
    Unknown(String),

    #[error("{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
}

impl Command {
    /// Parse one line; the command word is case-insensitive
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));
        if word.is_empty() {
            return Err(CommandError::Empty);
        }

        let required = |command: &'static str, argument: &'static str| {
            rest.split_whitespace()
                .next()
                .map(str::to_string)
                .ok_or(CommandError::MissingArgument { command, argument })
        };

        match word.to_ascii_uppercase().as_str() {
            "DUMPTABLE" => Ok(Command::DumpTable(PathBuf::from(required("DUMPTABLE", "a file name")?))),
            "FORCEUPDATE" => Ok(Command::ForceUpdate),
            "CHECKSTABLE" => Ok(Command::CheckStable),
            "SNDMSG" => {
                let destination = required("SNDMSG", "a destination")?;
                let text = rest[destination.len()..].trim().to_string();
                Ok(Command::SendMessage { destination, text })
            }
            "PING" => Ok(Command::Ping(required("PING", "a destination")?)),
            "TRACEROUTE" => Ok(Command::Traceroute(required("TRACEROUTE", "a destination")?)),
            "SHUTDOWN" => Ok(Command::Shutdown),
            _ => Err(CommandError::Unknown(word.to_string())),
        }
    }
}
