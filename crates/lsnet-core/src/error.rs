//! Error types for lsnet

use thiserror::Error;

/// Top-level error type for lsnet core operations
#[derive(Debug, Error)]
pub enum LsnetError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors related to node identity
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Hostname must not be empty")]
    EmptyHostname,

    #[error("Invalid ip address: {0}")]
    InvalidAddress(String),
}

/// Errors related to the wire protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(String),

    #[error("Invalid neighbor key: {0}")]
    InvalidNeighborKey(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidControlPayload { kind: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for lsnet core operations
pub type LsnetResult<T> = Result<T, LsnetError>;
