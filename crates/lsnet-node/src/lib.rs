//! # lsnet Node
//!
//! Link-state overlay routing node.
//!
//! This crate provides [`OverlayNode`], which ties together:
//! - Transport (one TCP connection per packet, newline-delimited JSON)
//! - Routing (topology graph, flooding, Dijkstra route computation)
//! - Forwarding (next-hop delivery, fragmentation, reassembly, retry)
//!
//! ## Example
//!
//! ```rust,ignore
//! use lsnet_node::{NodeConfig, OverlayNode};
//!
//! let config = NodeConfig::load("config", "n1")?;
//! let node = OverlayNode::new(config)?;
//! node.start().await?;
//!
//! // Send a message once a route exists
//! let id = node.send_message("n3", "hello").await?;
//!
//! // Watch what comes back
//! let mut deliveries = node.deliveries();
//! while let Ok(event) = deliveries.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod control;
mod error;
pub mod fragment;
mod forwarding;
pub mod link_state;
pub mod reassembly;
pub mod retry;
mod shutdown;

pub use clock::NodeClock;
pub use command::{Command, CommandError};
pub use config::{Link, NodeConfig, StaticTopology};
pub use control::{DeliveryEvent, TraceHop};
pub use error::{ConfigError, NodeError, NodeResult};
pub use link_state::LinkStateEvent;
pub use reassembly::{FragmentationError, ReassemblyOutcome, Reassembler};
pub use retry::{RetryDecision, RetryPolicy};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lsnet_core::{
    ControlMessage, ControlPacket, Cost, NodeAddr, PacketId, PingPayload, TextPayload,
    TraceroutePayload,
};
use lsnet_routing::{FloodEngine, RoutingError, RoutingTable, SharedRoutingTable};
use lsnet_transport::{Connector, PacketListener};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, debug, error, info, instrument, warn};

use control::{ControlConsumer, ControlHandler};
use forwarding::{Forwarder, InboundSink, OutboundConsumer};
use link_state::{Flooder, LinkStateConsumer};
use shutdown::Stage;

/// Queue ends handed to the workers at start
struct Receivers {
    link_state: mpsc::UnboundedReceiver<LinkStateEvent>,
    control: mpsc::UnboundedReceiver<ControlPacket>,
    outbound: mpsc::UnboundedReceiver<ControlPacket>,
}

/// A node of the link-state overlay
///
/// Owns the topology graph, the published routing table and the three
/// work queues (link-state, control, outbound), and runs the workers that
/// drain them.
pub struct OverlayNode {
    /// Node configuration
    config: NodeConfig,
    /// Flooding state and topology graph; one lock for both
    engine: Arc<Mutex<FloodEngine>>,
    /// Currently published routing table
    table: Arc<SharedRoutingTable>,
    clock: Arc<NodeClock>,
    /// Listening ports, read-only after construction
    ports: Arc<BTreeMap<String, u16>>,
    link_state_tx: mpsc::UnboundedSender<LinkStateEvent>,
    control_tx: mpsc::UnboundedSender<ControlPacket>,
    outbound_tx: mpsc::UnboundedSender<ControlPacket>,
    /// Taken by `start`
    receivers: Mutex<Option<Receivers>>,
    deliveries: broadcast::Sender<DeliveryEvent>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    /// Running workers grouped into shutdown stages, upstream first
    stages: tokio::sync::Mutex<Vec<Stage>>,
    /// Whether the node has been started
    started: AtomicBool,
    /// Address the accept loop is bound to
    local_addr: Mutex<Option<SocketAddr>>,
}

impl OverlayNode {
    /// Create a node
    ///
    /// Nothing touches the network until [`start`](Self::start).
    #[instrument(skip(config), fields(hostname = %config.local.name))]
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        if config.max_packet_size == 0 {
            return Err(ConfigError::Invalid("max_packet_size must be positive".into()).into());
        }

        let local = config.local.clone();
        let engine = FloodEngine::new(local.clone(), config.local_links());
        let table = SharedRoutingTable::new(local.clone());

        let (link_state_tx, link_state_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (deliveries, _) = broadcast::channel(config.delivery_channel_capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(4);

        info!(neighbors = config.local_links().len(), "Node created");

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            table: Arc::new(table),
            clock: Arc::new(NodeClock::new(config.clock_tick)),
            ports: Arc::new(config.topology.ports().clone()),
            link_state_tx,
            control_tx,
            outbound_tx,
            receivers: Mutex::new(Some(Receivers {
                link_state: link_state_rx,
                control: control_rx,
                outbound: outbound_rx,
            })),
            deliveries,
            shutdown_tx,
            stages: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            config,
        })
    }

    /// Start the node
    ///
    /// Binds the listening socket, spawns every worker and announces the
    /// local links to the neighbors.
    #[instrument(skip(self), fields(hostname = %self.config.local.name))]
    pub async fn start(&self) -> NodeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        let bind_addr = self.config.local.socket_addr(self.config.listen_port);
        let listener = match PacketListener::bind(bind_addr, self.config.connection.clone()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let Some(receivers) = self.receivers.lock().take() else {
            // Stopped nodes cannot be restarted: their queues are gone
            self.started.store(false, Ordering::SeqCst);
            return Err(NodeError::Shutdown);
        };
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);

        let stages = {
            let span = lsnet_logging::node_span(&self.config.local.name);
            let _entered = span.enter();
            self.spawn_workers(listener, receivers)
        };
        *self.stages.lock().await = stages;

        self.link_state_tx
            .send(LinkStateEvent::Reoriginate)
            .map_err(|_| NodeError::Shutdown)?;

        info!(%bound, "Node started");
        Ok(())
    }

    fn spawn_workers(&self, listener: PacketListener, receivers: Receivers) -> Vec<Stage> {
        let local = self.config.local.clone();
        let connector = Connector::new(self.config.connection.clone());
        let mut ingress = Stage::new("ingress");
        let mut inbound = Stage::new("inbound");
        let mut outbound = Stage::new("outbound");

        let sink = Arc::new(InboundSink::new(self.link_state_tx.clone(), self.control_tx.clone()));
        let shutdown_rx = ingress.subscribe();
        ingress.push(tokio::spawn(
            async move {
                if let Err(e) = listener.run(sink, shutdown_rx).await {
                    error!(error = %e, "accept loop failed");
                }
            }
            .in_current_span(),
        ));
        ingress.push(tokio::spawn(
            periodic_refresh(
                self.config.weight_file.clone(),
                self.config.local.name.clone(),
                self.config.update_interval,
                self.config.reannounce_interval,
                self.link_state_tx.clone(),
                ingress.subscribe(),
            )
            .in_current_span(),
        ));

        let flooder = Flooder::new(
            connector.clone(),
            Arc::clone(&self.ports),
            self.config.flood_retry,
            self.shutdown_tx.clone(),
        );
        inbound.push(
            LinkStateConsumer::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.table),
                flooder,
                receivers.link_state,
                self.shutdown_tx.clone(),
            )
            .spawn(inbound.subscribe()),
        );
        inbound.push(
            ControlConsumer::new(
                ControlHandler::new(local.clone(), Arc::clone(&self.clock)),
                receivers.control,
                self.outbound_tx.clone(),
                self.deliveries.clone(),
                self.config.reassembly_timeout,
            )
            .spawn(inbound.subscribe()),
        );

        let forwarder = Forwarder::new(
            local,
            Arc::clone(&self.table),
            Arc::clone(&self.ports),
            connector,
            self.config.max_packet_size,
            self.config.no_route_retry,
            self.config.connection_retry,
            self.outbound_tx.clone(),
            self.control_tx.clone(),
            self.deliveries.clone(),
            outbound.signal(),
        );
        outbound.push(OutboundConsumer::new(forwarder, receivers.outbound).spawn(outbound.subscribe()));
        outbound.push(Arc::clone(&self.clock).spawn_ticker(outbound.subscribe()));

        vec![ingress, inbound, outbound]
    }

    /// Stop the node
    ///
    /// Stops accepting connections and waits for in-flight inbound
    /// connections, then lets the inbound consumers drain their queues, and
    /// only then drains the outbound queue with one final send attempt per
    /// packet. Each step waits for the previous one to finish.
    #[instrument(skip(self), fields(hostname = %self.config.local.name))]
    pub async fn stop(&self) -> NodeResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(NodeError::NotStarted);
        }

        // Flood retries and ping watchers stop here
        let _ = self.shutdown_tx.send(());

        let stages = std::mem::take(&mut *self.stages.lock().await);
        shutdown::stop_in_order(stages).await;

        info!("Node stopped");
        Ok(())
    }

    /// Whether the node is running
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// This node's address
    pub fn local(&self) -> &NodeAddr {
        &self.config.local
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Socket the accept loop is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Subscribe to the shutdown signal
    ///
    /// Fires on [`stop`](Self::stop), and when route computation hits an
    /// internal invariant violation; the owner should then call `stop`.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// The currently published routing table
    pub fn current_routing_table(&self) -> Arc<RoutingTable> {
        self.table.snapshot()
    }

    /// Whether a route computation is in progress
    pub fn is_recomputing(&self) -> bool {
        self.table.is_recomputing()
    }

    /// Re-check the local links and flood them
    ///
    /// Re-reads the weights file when one is configured.
    #[instrument(skip(self), fields(hostname = %self.config.local.name))]
    pub async fn trigger_force_update(&self) -> NodeResult<()> {
        if !self.is_started() {
            return Err(NodeError::NotStarted);
        }
        let event = refresh_event(self.config.weight_file.as_deref(), &self.config.local.name).await;
        self.link_state_tx.send(event).map_err(|_| NodeError::Shutdown)
    }

    /// Replace the local links and flood them
    pub fn update_local_links(&self, links: BTreeMap<NodeAddr, Cost>) -> NodeResult<()> {
        self.link_state_tx
            .send(LinkStateEvent::LocalChange(links))
            .map_err(|_| NodeError::Shutdown)
    }

    /// Queue a packet for forwarding
    pub fn submit(&self, packet: ControlPacket) -> NodeResult<PacketId> {
        let id = packet.id();
        debug!(packet = %id, kind = %packet.kind, destination = ?packet.destination_name, "submitting packet");
        self.outbound_tx.send(packet).map_err(|_| NodeError::Shutdown)?;
        Ok(id)
    }

    /// Send a text message to `destination`
    pub async fn send_message(&self, destination: &str, text: impl Into<String>) -> NodeResult<PacketId> {
        let message = ControlMessage::SendMessage(TextPayload { message: text.into() });
        self.submit(self.packet_to(destination, message)?)
    }

    /// Ping `destination`
    ///
    /// The reply is published as [`DeliveryEvent::PingReply`]; if none
    /// arrives within the ping timeout, [`DeliveryEvent::PingTimeout`].
    pub async fn ping(&self, destination: &str) -> NodeResult<PacketId> {
        let message = ControlMessage::Ping(PingPayload {
            sent_at: self.clock.now_millis(),
            reply: false,
        });
        let packet = self.packet_to(destination, message)?;
        let events = self.deliveries.subscribe();
        let id = self.submit(packet)?;

        tokio::spawn(
            watch_ping(
                events,
                self.deliveries.clone(),
                destination.to_string(),
                id.sequence,
                self.config.ping_timeout,
                self.shutdown_tx.subscribe(),
            )
            .in_current_span(),
        );
        Ok(id)
    }

    /// Trace the path to `destination`
    pub async fn traceroute(&self, destination: &str) -> NodeResult<PacketId> {
        let message = ControlMessage::Traceroute(TraceroutePayload {
            data: format!("0 {} 0\n", self.config.local.name),
            hop_count: 0,
            last_hop_time: self.clock.now_millis(),
            complete: false,
        });
        self.submit(self.packet_to(destination, message)?)
    }

    /// Write the routing table to `path` as CSV
    pub async fn dump_table(&self, path: impl AsRef<Path>) -> NodeResult<()> {
        let csv = self.table.snapshot().to_csv();
        tokio::fs::write(path.as_ref(), csv).await?;
        debug!(path = %path.as_ref().display(), "routing table dumped");
        Ok(())
    }

    /// Subscribe to delivery events
    pub fn deliveries(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.deliveries.subscribe()
    }

    /// Logical node time in milliseconds
    pub fn node_time(&self) -> u64 {
        self.clock.now_millis()
    }

    fn packet_to(&self, destination: &str, message: ControlMessage) -> NodeResult<ControlPacket> {
        let destination = self.resolve(destination)?;
        Ok(ControlPacket::from_message(
            &self.config.local,
            Some(&destination),
            message,
            self.clock.now_secs(),
        )?)
    }

    /// Address of `hostname` from the static topology or the routing table
    fn resolve(&self, hostname: &str) -> NodeResult<NodeAddr> {
        if let Some(addr) = self.config.topology.address_of(hostname) {
            return Ok(addr.clone());
        }
        if hostname == self.config.local.name {
            return Ok(self.config.local.clone());
        }
        self.table
            .snapshot()
            .get(hostname)
            .map(|entry| entry.destination.clone())
            .ok_or_else(|| RoutingError::UnknownNode(hostname.to_string()).into())
    }
}

/// Event for a force update: new links from the weights file, or a plain
/// re-announcement when there is no file or it cannot be read
async fn refresh_event(weight_file: Option<&Path>, hostname: &str) -> LinkStateEvent {
    let Some(path) = weight_file else {
        return LinkStateEvent::Reoriginate;
    };
    match config::reload_local_links(path, hostname).await {
        Ok(links) => LinkStateEvent::LocalChange(links),
        Err(e) => {
            warn!(error = %e, "failed to re-read weights, re-announcing current links");
            LinkStateEvent::Reoriginate
        }
    }
}

/// Local link checks and periodic re-announcement
///
/// Every `check_every` the weights file (if any) is re-read and handed over
/// as a [`LinkStateEvent::Recheck`], which only floods when the links
/// changed. Every `reannounce_every` the current links are flooded anyway so
/// that neighbors which started late still converge.
async fn periodic_refresh(
    weight_file: Option<PathBuf>,
    hostname: String,
    check_every: Duration,
    reannounce_every: Duration,
    link_state_tx: mpsc::UnboundedSender<LinkStateEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let floor = Duration::from_millis(10);
    let mut check = tokio::time::interval(check_every.max(floor));
    let mut reannounce = tokio::time::interval(reannounce_every.max(floor));
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    reannounce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first ticks complete immediately; start announces on its own
    check.tick().await;
    reannounce.tick().await;

    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = check.tick() => {
                let Some(path) = weight_file.as_deref() else { continue };
                match config::reload_local_links(path, &hostname).await {
                    Ok(links) => LinkStateEvent::Recheck(links),
                    Err(e) => {
                        warn!(error = %e, "failed to re-read weights");
                        continue;
                    }
                }
            }
            _ = reannounce.tick() => LinkStateEvent::Reoriginate,
        };
        if link_state_tx.send(event).is_err() {
            break;
        }
    }
    debug!("refresh timer stopped");
}

/// Publish a timeout unless the reply for `sequence` shows up in time
async fn watch_ping(
    mut events: broadcast::Receiver<DeliveryEvent>,
    deliveries: broadcast::Sender<DeliveryEvent>,
    destination: String,
    sequence: u64,
    timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let reply = async {
        loop {
            match events.recv().await {
                Ok(DeliveryEvent::PingReply { from, sequence: seq, .. })
                    if seq == sequence && from == destination =>
                {
                    return true;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        answered = tokio::time::timeout(timeout, reply) => {
            if !matches!(answered, Ok(true)) {
                debug!(destination = %destination, sequence, "ping timed out");
                let _ = deliveries.send(DeliveryEvent::PingTimeout {
                    destination: destination.clone(),
                    sequence,
                });
            }
        }
    }
}
