//! Outbound connections
//!
//! Every packet (or fragment) gets its own TCP connection: connect, write a
//! single newline-terminated JSON line, close. There is no pooling.

use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use lsnet_core::WirePacket;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{instrument, trace};

use crate::error::{TransportError, TransportResult};

/// Configuration shared by the connector and the listener
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on establishing an outbound connection
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the next line from an inbound peer
    pub read_timeout: Duration,
    /// Longest accepted line in bytes
    pub max_line_length: usize,
    /// How long shutdown waits for in-flight inbound connections
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(10),
            max_line_length: 1024 * 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the inbound read timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set the maximum line length
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    pub(crate) fn codec(&self) -> LinesCodec {
        LinesCodec::new_with_max_length(self.max_line_length)
    }
}

/// Sends packets over short-lived TCP connections
#[derive(Debug, Clone, Default)]
pub struct Connector {
    config: ConnectionConfig,
}

impl Connector {
    /// Create a connector
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// The connector's configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Serialize `packet` and send it to `addr`
    #[instrument(level = "trace", skip(self, packet), fields(kind = packet.kind().tag()))]
    pub async fn send(&self, addr: SocketAddr, packet: &WirePacket) -> TransportResult<()> {
        let line = packet.to_line()?;
        self.send_line(addr, line).await
    }

    /// Send one pre-serialized line to `addr`
    pub async fn send_line(&self, addr: SocketAddr, line: String) -> TransportResult<()> {
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(TransportError::Timeout(addr)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::ConnectionRefused(addr));
            }
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        };

        let bytes = line.len();
        let mut framed = Framed::new(stream, self.config.codec());
        framed.send(line).await?;
        framed.into_inner().shutdown().await?;
        trace!(%addr, bytes, "packet sent");
        Ok(())
    }
}
