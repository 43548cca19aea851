//! Forwarding engine
//!
//! Inbound: [`InboundSink`] classifies every packet read by the accept loop
//! onto the link-state queue or the control queue.
//!
//! Outbound: the [`OutboundConsumer`] pops control packets, resolves the
//! next hop from the current routing table snapshot, fragments oversized
//! payloads and writes each piece over its own connection. Failures are
//! handed to a [`RetryPolicy`]: packets with no route are bounced toward
//! their source or retried a bounded number of times; packets whose next
//! hop refused the connection are retried without bound. Retries are
//! re-enqueued by a timer task so the consumer never sleeps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lsnet_core::{ControlPacket, NodeAddr, WirePacket};
use lsnet_routing::{RoutingError, SharedRoutingTable};
use lsnet_transport::{Connector, PacketSink};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, trace, warn};

use crate::control::DeliveryEvent;
use crate::fragment::fragment;
use crate::link_state::LinkStateEvent;
use crate::retry::{RetryDecision, RetryPolicy};

/// Routes inbound wire packets onto the node's queues
#[derive(Debug, Clone)]
pub(crate) struct InboundSink {
    link_state_tx: mpsc::UnboundedSender<LinkStateEvent>,
    control_tx: mpsc::UnboundedSender<ControlPacket>,
}

impl InboundSink {
    pub(crate) fn new(
        link_state_tx: mpsc::UnboundedSender<LinkStateEvent>,
        control_tx: mpsc::UnboundedSender<ControlPacket>,
    ) -> Self {
        Self {
            link_state_tx,
            control_tx,
        }
    }
}

impl PacketSink for InboundSink {
    fn deliver(&self, packet: WirePacket) {
        let queued = match packet {
            WirePacket::LinkState(record) => self.link_state_tx.send(LinkStateEvent::Remote(record)).is_ok(),
            WirePacket::Control(packet) => self.control_tx.send(packet).is_ok(),
        };
        if !queued {
            debug!("queue closed, inbound packet dropped");
        }
    }
}

/// Whether a failed send may be retried later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Normal operation
    Retrying,
    /// Shutdown drain: one attempt, failures are reported
    Final,
}

/// Everything the outbound consumer needs to move a packet one hop
#[derive(Debug)]
pub(crate) struct Forwarder {
    local: NodeAddr,
    table: Arc<SharedRoutingTable>,
    ports: Arc<BTreeMap<String, u16>>,
    connector: Connector,
    max_packet_size: usize,
    no_route: RetryPolicy,
    connection: RetryPolicy,
    /// Re-enqueue into the outbound queue
    requeue: mpsc::UnboundedSender<ControlPacket>,
    /// Packets addressed to this node go to the control queue
    local_tx: mpsc::UnboundedSender<ControlPacket>,
    deliveries: broadcast::Sender<DeliveryEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Forwarder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: NodeAddr,
        table: Arc<SharedRoutingTable>,
        ports: Arc<BTreeMap<String, u16>>,
        connector: Connector,
        max_packet_size: usize,
        no_route: RetryPolicy,
        connection: RetryPolicy,
        requeue: mpsc::UnboundedSender<ControlPacket>,
        local_tx: mpsc::UnboundedSender<ControlPacket>,
        deliveries: broadcast::Sender<DeliveryEvent>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            local,
            table,
            ports,
            connector,
            max_packet_size,
            no_route,
            connection,
            requeue,
            local_tx,
            deliveries,
            shutdown_tx,
        }
    }

    /// Move one packet toward its destination
    pub(crate) async fn dispatch(&self, mut packet: ControlPacket, attempt: Attempt) {
        let Some(destination) = packet
            .destination_name
            .clone()
            .filter(|name| *name != self.local.name)
        else {
            return self.deliver_locally(packet);
        };

        let table = self.table.snapshot();
        if let Some(next_hop) = table.next_hop(&destination) {
            return self.send_via(next_hop.clone(), packet, attempt).await;
        }

        let can_bounce = !packet.bounced
            && packet.source_name != self.local.name
            && table.contains(&packet.source_name);
        if can_bounce {
            debug!(packet = %packet.id(), destination = %destination, "no route, bouncing to source");
            packet.bounce(&self.local);
            if let Some(next_hop) = packet
                .destination_name
                .as_deref()
                .and_then(|dest| table.next_hop(dest))
                .cloned()
            {
                return self.send_via(next_hop, packet, attempt).await;
            }
        }

        packet.attempts += 1;
        let decision = match attempt {
            Attempt::Retrying => self.no_route.decide(packet.attempts),
            Attempt::Final => RetryDecision::GiveUp,
        };
        match decision {
            RetryDecision::Retry(delay) => {
                debug!(packet = %packet.id(), destination = %destination, attempts = packet.attempts, ?delay, "no route, retrying later");
                self.schedule_retry(packet, delay);
            }
            RetryDecision::GiveUp => {
                warn!(packet = %packet.id(), destination = %destination, attempts = packet.attempts, "no route, dropping packet");
                let reason = RoutingError::NoRoute(destination).to_string();
                self.report_undeliverable(&packet, &reason);
            }
        }
    }

    async fn send_via(&self, next_hop: NodeAddr, mut packet: ControlPacket, attempt: Attempt) {
        let Some(port) = self.ports.get(&next_hop.name).copied() else {
            warn!(packet = %packet.id(), next_hop = %next_hop, "no port known for next hop, dropping packet");
            return self.report_undeliverable(&packet, &format!("no port for next hop {next_hop}"));
        };
        let pieces = match fragment(&packet, self.max_packet_size) {
            Ok(pieces) => pieces,
            Err(e) => {
                warn!(packet = %packet.id(), error = %e, "failed to fragment packet");
                return self.report_undeliverable(&packet, &e.to_string());
            }
        };

        let addr = next_hop.socket_addr(port);
        let count = pieces.len();
        for piece in pieces {
            let Err(e) = self.connector.send(addr, &WirePacket::Control(piece)).await else {
                continue;
            };
            packet.attempts += 1;
            let decision = match attempt {
                Attempt::Retrying if e.is_retryable() => self.connection.decide(packet.attempts),
                _ => RetryDecision::GiveUp,
            };
            match decision {
                RetryDecision::Retry(delay) => {
                    debug!(packet = %packet.id(), next_hop = %next_hop, error = %e, attempts = packet.attempts, ?delay, "send failed, retrying later");
                    self.schedule_retry(packet, delay);
                }
                RetryDecision::GiveUp => {
                    warn!(packet = %packet.id(), next_hop = %next_hop, error = %e, "send failed, dropping packet");
                    self.report_undeliverable(&packet, &e.to_string());
                }
            }
            return;
        }
        trace!(packet = %packet.id(), next_hop = %next_hop, fragments = count, "forwarded");
    }

    fn deliver_locally(&self, packet: ControlPacket) {
        if let Err(e) = self.local_tx.send(packet) {
            warn!(packet = %e.0.id(), "control queue closed, dropping local packet");
            self.report_undeliverable(&e.0, "control queue closed");
        }
    }

    /// Re-enqueue `packet` after `delay` from a timer task
    fn schedule_retry(&self, packet: ControlPacket, delay: Duration) {
        let requeue = self.requeue.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = requeue.send(packet) {
                        warn!(packet = %e.0.id(), "outbound queue closed, retry dropped");
                    }
                }
                _ = shutdown_rx.recv() => {
                    warn!(packet = %packet.id(), attempts = packet.attempts, "pending retry abandoned at shutdown");
                }
            }
        }
        .in_current_span());
    }

    fn report_undeliverable(&self, packet: &ControlPacket, reason: &str) {
        let event = DeliveryEvent::Undeliverable {
            id: packet.id(),
            destination: packet.destination_name.clone(),
            reason: reason.to_string(),
        };
        if self.deliveries.send(event).is_err() {
            trace!("no delivery subscribers");
        }
    }
}

/// Worker draining the outbound queue
pub(crate) struct OutboundConsumer {
    forwarder: Forwarder,
    rx: mpsc::UnboundedReceiver<ControlPacket>,
}

impl OutboundConsumer {
    pub(crate) fn new(forwarder: Forwarder, rx: mpsc::UnboundedReceiver<ControlPacket>) -> Self {
        Self { forwarder, rx }
    }

    /// Spawn the consumer task
    pub(crate) fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx).in_current_span())
    }

    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("outbound consumer shutting down");
                    break;
                }
                packet = self.rx.recv() => {
                    match packet {
                        Some(packet) => self.forwarder.dispatch(packet, Attempt::Retrying).await,
                        None => break,
                    }
                }
            }
        }

        // Refuse new work, keep what is already buffered
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(packet) = self.rx.try_recv() {
            self.forwarder.dispatch(packet, Attempt::Final).await;
            drained += 1;
        }
        debug!(drained, "outbound consumer stopped");
    }
}
