//! Transport layer error types

use std::net::SocketAddr;

use lsnet_core::ProtocolError;
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Unified transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out talking to {0}")]
    Timeout(SocketAddr),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the failure models a transient link or node outage
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused(_)
                | TransportError::Connect { .. }
                | TransportError::Timeout(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7001".parse().unwrap()
    }

    #[test]
    fn test_retryable() {
        assert!(TransportError::ConnectionRefused(addr()).is_retryable());
        assert!(TransportError::Timeout(addr()).is_retryable());
        assert!(
            TransportError::Connect {
                addr: addr(),
                source: std::io::Error::other("unreachable"),
            }
            .is_retryable()
        );
        assert!(!TransportError::Protocol(ProtocolError::UnknownPacketType("X".into())).is_retryable());
        assert!(!TransportError::Codec(LinesCodecError::MaxLineLengthExceeded).is_retryable());
    }

    #[test]
    fn test_display_names_peer() {
        let msg = TransportError::ConnectionRefused(addr()).to_string();
        assert!(msg.contains("127.0.0.1:7001"));
    }
}
