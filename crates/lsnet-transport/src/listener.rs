//! Inbound accept loop
//!
//! [`PacketListener::run`] accepts connections until shutdown, spawning one
//! task per connection. Each task reads newline-delimited JSON packets until
//! the peer closes and hands every well-formed packet to a [`PacketSink`].
//! Malformed lines are logged and skipped.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use lsnet_core::WirePacket;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::connection::ConnectionConfig;
use crate::error::{TransportError, TransportResult};

/// Receives packets decoded by the listener
pub trait PacketSink: Send + Sync + 'static {
    /// Take ownership of one inbound packet
    fn deliver(&self, packet: WirePacket);
}

impl PacketSink for mpsc::UnboundedSender<WirePacket> {
    fn deliver(&self, packet: WirePacket) {
        if self.send(packet).is_err() {
            debug!("packet sink closed, dropping packet");
        }
    }
}

/// Listens for inbound packet connections
#[derive(Debug)]
pub struct PacketListener {
    listener: TcpListener,
    config: ConnectionConfig,
}

impl PacketListener {
    /// Bind to `addr`
    pub async fn bind(addr: SocketAddr, config: ConnectionConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self { listener, config })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    ///
    /// On shutdown the listening socket is closed first, then connections
    /// already accepted get up to `drain_timeout` to finish.
    pub async fn run<S: PacketSink>(
        self,
        sink: Arc<S>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> TransportResult<()> {
        let local = self.local_addr()?;
        info!(%local, "accepting packets");
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let sink = Arc::clone(&sink);
                        let config = self.config.clone();
                        handlers.spawn(async move {
                            match handle_connection(stream, peer, sink.as_ref(), &config).await {
                                Ok(count) => debug!(%peer, count, "inbound connection closed"),
                                Err(e) => warn!(%peer, error = %e, "inbound connection failed"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(self.listener);
        let in_flight = handlers.len();
        if in_flight > 0 {
            debug!(in_flight, "draining inbound connections");
            let drained = timeout(self.config.drain_timeout, async {
                while handlers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = handlers.len(), "aborting inbound connections after drain timeout");
                handlers.abort_all();
            }
        }
        info!(%local, "listener stopped");
        Ok(())
    }
}

async fn handle_connection<S: PacketSink + ?Sized>(
    stream: TcpStream,
    peer: SocketAddr,
    sink: &S,
    config: &ConnectionConfig,
) -> TransportResult<usize> {
    let mut framed = Framed::new(stream, config.codec());
    let mut delivered = 0;

    loop {
        let next = timeout(config.read_timeout, framed.next())
            .await
            .map_err(|_| TransportError::Timeout(peer))?;
        let Some(line) = next else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match WirePacket::from_line(&line) {
            Ok(packet) => {
                sink.deliver(packet);
                delivered += 1;
            }
            Err(e) => warn!(%peer, error = %e, "dropping malformed packet"),
        }
    }
    Ok(delivered)
}
