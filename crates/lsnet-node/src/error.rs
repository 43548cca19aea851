//! Error types for the node coordinator

use std::path::PathBuf;

use lsnet_core::{IdentityError, ProtocolError};
use lsnet_routing::RoutingError;
use lsnet_transport::TransportError;
use thiserror::Error;

/// Malformed or missing configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("No listening port for host {0}")]
    MissingPort(String),

    #[error("Port {port} assigned to both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Host {name} listed with two addresses: {first} and {second}")]
    ConflictingAddress {
        name: String,
        first: String,
        second: String,
    },

    #[error("Host {0} does not appear in the weights file")]
    UnknownHost(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn parse(path: &std::path::Path, line: usize, reason: impl Into<String>) -> Self {
        ConfigError::Parse {
            path: path.to_path_buf(),
            line,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur in the node coordinator
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Routing error
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Bad node identity
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Node already started
    #[error("Node already started")]
    AlreadyStarted,

    /// Node not started
    #[error("Node not started")]
    NotStarted,

    /// The node is shutting down and no longer accepts work
    #[error("Node is shutting down")]
    Shutdown,
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;
