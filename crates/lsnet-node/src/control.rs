//! Control-message handling
//!
//! The control consumer pops packets off the control queue, reassembles
//! fragments addressed to this node and runs the per-kind logic:
//! traceroutes are stamped at every hop, pings are answered, text messages
//! and opaque kinds are handed to subscribers as [`DeliveryEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use lsnet_core::{ControlMessage, ControlPacket, NodeAddr, PacketId, PingPayload, TraceroutePayload};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, trace, warn};

use crate::clock::NodeClock;
use crate::reassembly::{FragmentationError, ReassemblyOutcome, Reassembler};

/// One line of a completed traceroute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHop {
    pub hop: u32,
    pub hostname: String,
    /// Time spent reaching this hop from the previous one
    pub millis: u64,
}

impl TraceHop {
    /// Parse the `"<hop> <hostname> <ms>"` lines of a trace
    pub fn parse_all(data: &str) -> Vec<TraceHop> {
        data.lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let hop = parts.next()?.parse().ok()?;
                let hostname = parts.next()?.to_string();
                let millis = parts.next()?.parse().ok()?;
                Some(TraceHop { hop, hostname, millis })
            })
            .collect()
    }
}

/// Something that happened to traffic owned by this node
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    /// A text message arrived
    Message { from: String, text: String },
    /// A ping we sent came back
    PingReply { from: String, sequence: u64, rtt: Duration },
    /// A ping we sent got no reply in time
    PingTimeout { destination: String, sequence: u64 },
    /// A traceroute we started came back complete
    Traceroute { destination: String, hops: Vec<TraceHop>, hop_count: u32 },
    /// A control kind the core does not interpret
    Control(ControlPacket),
    /// A fragmented packet could only be partially received
    PartialDelivery {
        id: PacketId,
        kind: String,
        received_bytes: usize,
        reason: FragmentationError,
    },
    /// A packet was dropped without reaching its destination
    Undeliverable {
        id: PacketId,
        destination: Option<String>,
        reason: String,
    },
}

/// What to do with a packet after local handling
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ControlAction {
    /// Hand to the outbound queue
    Forward(ControlPacket),
    /// Publish to subscribers
    Deliver(DeliveryEvent),
    Drop,
}

/// Per-kind logic, free of queues so it can be driven directly in tests
#[derive(Debug, Clone)]
pub(crate) struct ControlHandler {
    local: NodeAddr,
    clock: Arc<NodeClock>,
}

impl ControlHandler {
    pub(crate) fn new(local: NodeAddr, clock: Arc<NodeClock>) -> Self {
        Self { local, clock }
    }

    /// Handle one whole (reassembled) packet
    pub(crate) fn handle(&self, mut packet: ControlPacket) -> ControlAction {
        if !packet.is_for(&self.local.name) {
            if packet.kind == "TRACEROUTE" && !packet.is_fragment() {
                self.stamp_in_transit(&mut packet);
            }
            return ControlAction::Forward(packet);
        }

        if packet.bounced {
            return ControlAction::Deliver(DeliveryEvent::Undeliverable {
                id: PacketId {
                    source: self.local.name.clone(),
                    sequence: packet.sequence,
                },
                destination: None,
                reason: format!("no route, returned by {}", packet.source_name),
            });
        }

        let message = match packet.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(packet = %packet.id(), error = %e, "dropping undecodable control packet");
                return ControlAction::Drop;
            }
        };

        match message {
            ControlMessage::Traceroute(trace) if trace.complete => {
                ControlAction::Deliver(DeliveryEvent::Traceroute {
                    destination: packet.source_name.clone(),
                    hops: TraceHop::parse_all(&trace.data),
                    hop_count: trace.hop_count,
                })
            }
            ControlMessage::Traceroute(mut trace) => {
                self.stamp(&mut trace);
                trace.complete = true;
                self.reply(packet, ControlMessage::Traceroute(trace))
            }
            ControlMessage::Ping(ping) if ping.reply => {
                let rtt = self.clock.now_millis().saturating_sub(ping.sent_at);
                ControlAction::Deliver(DeliveryEvent::PingReply {
                    from: packet.source_name,
                    sequence: packet.sequence,
                    rtt: Duration::from_millis(rtt),
                })
            }
            ControlMessage::Ping(ping) => {
                let echo = PingPayload {
                    sent_at: ping.sent_at,
                    reply: true,
                };
                self.reply(packet, ControlMessage::Ping(echo))
            }
            ControlMessage::SendMessage(text) => ControlAction::Deliver(DeliveryEvent::Message {
                from: packet.source_name,
                text: text.message,
            }),
            ControlMessage::Opaque { .. } => ControlAction::Deliver(DeliveryEvent::Control(packet)),
        }
    }

    fn stamp_in_transit(&self, packet: &mut ControlPacket) {
        match packet.message() {
            Ok(ControlMessage::Traceroute(mut trace)) if !trace.complete => {
                self.stamp(&mut trace);
                match ControlMessage::Traceroute(trace).into_parts() {
                    Ok((_, payload)) => packet.payload = payload,
                    Err(e) => warn!(packet = %packet.id(), error = %e, "failed to re-encode traceroute"),
                }
            }
            Ok(_) => {}
            Err(e) => debug!(packet = %packet.id(), error = %e, "forwarding undecodable traceroute unchanged"),
        }
    }

    /// Append this hop to a trace
    fn stamp(&self, trace: &mut TraceroutePayload) {
        let now = self.clock.now_millis();
        trace.hop_count += 1;
        trace.data.push_str(&format!(
            "{} {} {}\n",
            trace.hop_count,
            self.local.name,
            now.saturating_sub(trace.last_hop_time)
        ));
        trace.last_hop_time = now;
    }

    /// Send `message` back to the packet's source under the same sequence number
    fn reply(&self, packet: ControlPacket, message: ControlMessage) -> ControlAction {
        let origin = packet.source();
        match ControlPacket::from_message(&self.local, Some(&origin), message, self.clock.now_secs()) {
            Ok(reply) => ControlAction::Forward(reply.with_sequence(packet.sequence)),
            Err(e) => {
                warn!(packet = %packet.id(), error = %e, "failed to build reply");
                ControlAction::Drop
            }
        }
    }
}

/// Worker draining the control queue
pub(crate) struct ControlConsumer {
    handler: ControlHandler,
    reassembler: Reassembler,
    rx: mpsc::UnboundedReceiver<ControlPacket>,
    outbound: mpsc::UnboundedSender<ControlPacket>,
    deliveries: broadcast::Sender<DeliveryEvent>,
    reassembly_timeout: Duration,
}

impl ControlConsumer {
    pub(crate) fn new(
        handler: ControlHandler,
        rx: mpsc::UnboundedReceiver<ControlPacket>,
        outbound: mpsc::UnboundedSender<ControlPacket>,
        deliveries: broadcast::Sender<DeliveryEvent>,
        reassembly_timeout: Duration,
    ) -> Self {
        Self {
            handler,
            reassembler: Reassembler::new(),
            rx,
            outbound,
            deliveries,
            reassembly_timeout,
        }
    }

    /// Spawn the consumer task
    pub(crate) fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx).in_current_span())
    }

    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let sweep_every = (self.reassembly_timeout / 2).max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("control consumer shutting down");
                    break;
                }
                packet = self.rx.recv() => {
                    match packet {
                        Some(packet) => self.process(packet),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    for outcome in self.reassembler.expire(self.reassembly_timeout) {
                        self.settle(outcome);
                    }
                }
            }
        }

        // Refuse new work, keep what is already buffered
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(packet) = self.rx.try_recv() {
            self.process(packet);
            drained += 1;
        }
        for outcome in self.reassembler.drain() {
            self.settle(outcome);
        }
        debug!(drained, "control consumer stopped");
    }

    fn process(&mut self, packet: ControlPacket) {
        trace!(packet = %packet.id(), kind = %packet.kind, "control packet");
        if packet.is_fragment() && !packet.is_for(&self.handler.local.name) {
            self.forward(packet);
            return;
        }
        for outcome in self.reassembler.accept(packet) {
            self.settle(outcome);
        }
    }

    fn settle(&mut self, outcome: ReassemblyOutcome) {
        match outcome {
            ReassemblyOutcome::Complete(packet) => match self.handler.handle(packet) {
                ControlAction::Forward(packet) => self.forward(packet),
                ControlAction::Deliver(event) => self.publish(event),
                ControlAction::Drop => {}
            },
            ReassemblyOutcome::Failed {
                id,
                kind,
                received_bytes,
                reason,
            } => self.publish(DeliveryEvent::PartialDelivery {
                id,
                kind,
                received_bytes,
                reason,
            }),
        }
    }

    fn forward(&self, packet: ControlPacket) {
        if let Err(e) = self.outbound.send(packet) {
            let packet = e.0;
            warn!(packet = %packet.id(), "outbound queue closed, dropping packet");
            self.publish(DeliveryEvent::Undeliverable {
                id: packet.id(),
                destination: packet.destination_name,
                reason: "outbound queue closed".to_string(),
            });
        }
    }

    fn publish(&self, event: DeliveryEvent) {
        if self.deliveries.send(event).is_err() {
            trace!("no delivery subscribers");
        }
    }
}
