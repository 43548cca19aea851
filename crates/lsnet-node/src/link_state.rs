//! Link-state consumer and flooder
//!
//! The consumer pops one [`LinkStateEvent`], drains whatever else is
//! already queued, applies the whole batch to the [`FloodEngine`] and runs
//! one route computation for it. The engine lock covers both the graph
//! mutation and the computation; flooding starts only after it is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use lsnet_core::{Cost, LinkStateRecord, NodeAddr, WirePacket};
use lsnet_routing::{FloodEngine, FloodOutcome, RoutingError, RoutingResult, SharedRoutingTable};
use lsnet_transport::Connector;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::retry::{RetryDecision, RetryPolicy};

/// Work item for the link-state consumer
#[derive(Debug, Clone, PartialEq)]
pub enum LinkStateEvent {
    /// A record received from a neighbor
    Remote(LinkStateRecord),
    /// The local neighbor set changed; always originates a record
    LocalChange(BTreeMap<NodeAddr, Cost>),
    /// The local neighbor set as last read from disk; ignored when unchanged
    Recheck(BTreeMap<NodeAddr, Cost>),
    /// Re-announce the current local neighbor set
    Reoriginate,
}

/// Sends link-state records to neighbors
#[derive(Debug, Clone)]
pub(crate) struct Flooder {
    connector: Connector,
    ports: Arc<BTreeMap<String, u16>>,
    policy: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
}

impl Flooder {
    pub(crate) fn new(
        connector: Connector,
        ports: Arc<BTreeMap<String, u16>>,
        policy: RetryPolicy,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            connector,
            ports,
            policy,
            shutdown_tx,
        }
    }

    /// Send `record` to every target, one task per neighbor
    pub(crate) fn flood(&self, record: LinkStateRecord, targets: &[NodeAddr]) {
        let packet = Arc::new(WirePacket::LinkState(record));
        for target in targets {
            let Some(port) = self.ports.get(&target.name).copied() else {
                warn!(neighbor = %target, "no port known for neighbor, not flooding to it");
                continue;
            };
            let addr = target.socket_addr(port);
            let neighbor = target.name.clone();
            let packet = Arc::clone(&packet);
            let connector = self.connector.clone();
            let policy = self.policy;
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut failures = 0u32;
                loop {
                    let err = match connector.send(addr, &packet).await {
                        Ok(()) => {
                            trace!(neighbor = %neighbor, "flooded");
                            return;
                        }
                        Err(e) => e,
                    };
                    failures += 1;
                    let decision = if err.is_retryable() {
                        policy.decide(failures)
                    } else {
                        RetryDecision::GiveUp
                    };
                    match decision {
                        RetryDecision::Retry(delay) => {
                            debug!(neighbor = %neighbor, error = %err, failures, "flood failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown_rx.recv() => return,
                            }
                        }
                        RetryDecision::GiveUp => {
                            warn!(neighbor = %neighbor, error = %err, failures, "giving up flooding to neighbor");
                            return;
                        }
                    }
                }
            }
            .in_current_span());
        }
    }
}

/// Worker draining the link-state queue
pub(crate) struct LinkStateConsumer {
    engine: Arc<Mutex<FloodEngine>>,
    table: Arc<SharedRoutingTable>,
    flooder: Flooder,
    rx: mpsc::UnboundedReceiver<LinkStateEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LinkStateConsumer {
    pub(crate) fn new(
        engine: Arc<Mutex<FloodEngine>>,
        table: Arc<SharedRoutingTable>,
        flooder: Flooder,
        rx: mpsc::UnboundedReceiver<LinkStateEvent>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            engine,
            table,
            flooder,
            rx,
            shutdown_tx,
        }
    }

    /// Spawn the consumer task
    pub(crate) fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx).in_current_span())
    }

    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("link-state consumer shutting down");
                    break;
                }
                event = self.rx.recv() => {
                    let Some(first) = event else { break };
                    let mut batch = vec![first];
                    while let Ok(event) = self.rx.try_recv() {
                        batch.push(event);
                    }
                    if let Err(e) = self.apply(batch, true) {
                        if self.should_stop(&e) {
                            return;
                        }
                    }
                }
            }
        }

        // Refuse new work, keep what is already buffered
        self.rx.close();
        let mut batch = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            batch.push(event);
        }
        let drained = batch.len();
        if let Err(e) = self.apply(batch, false) {
            error!(error = %e, "route computation failed during shutdown drain");
        }
        debug!(drained, "link-state consumer stopped");
    }

    /// Log a failed computation; fatal ones signal node shutdown
    fn should_stop(&self, e: &RoutingError) -> bool {
        if e.is_fatal() {
            error!(error = %e, "route computation failed, stopping node");
            let _ = self.shutdown_tx.send(());
            true
        } else {
            warn!(error = %e, "route computation failed, keeping previous table");
            false
        }
    }

    /// Apply a batch, recompute once and optionally flood what changed
    fn apply(&self, batch: Vec<LinkStateEvent>, flood: bool) -> RoutingResult<()> {
        let (to_flood, targets) = {
            let mut engine = self.engine.lock();
            let mut to_flood = Vec::new();
            for event in batch {
                match event {
                    LinkStateEvent::Remote(record) => match engine.on_receive(record) {
                        FloodOutcome::Installed(record) | FloodOutcome::Updated(record) => {
                            to_flood.push(record)
                        }
                        FloodOutcome::Dropped { .. } => {}
                    },
                    LinkStateEvent::LocalChange(links) => {
                        to_flood.push(engine.on_local_topology_change(links))
                    }
                    LinkStateEvent::Recheck(links) if engine.links_differ(&links) => {
                        to_flood.push(engine.on_local_topology_change(links))
                    }
                    LinkStateEvent::Recheck(_) => trace!("local links unchanged"),
                    LinkStateEvent::Reoriginate => to_flood.push(engine.originate()),
                }
            }
            if to_flood.is_empty() {
                return Ok(());
            }

            let _computing = self.table.mark_computing();
            let table = engine.compute_routes()?;
            info!(routes = table.len(), records = to_flood.len(), "routing table updated");
            self.table.publish(table);

            let targets: Vec<NodeAddr> = engine.flood_targets().cloned().collect();
            (to_flood, targets)
        };

        if flood {
            for record in to_flood {
                self.flooder.flood(record, &targets);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsnet_transport::{ConnectionConfig, PacketListener};
    use std::time::Duration;

    fn n(i: u8) -> NodeAddr {
        NodeAddr::parse(&format!("n{i}"), "127.0.0.1").unwrap()
    }

    fn links(pairs: &[(u8, Cost)]) -> BTreeMap<NodeAddr, Cost> {
        pairs.iter().map(|(i, c)| (n(*i), *c)).collect()
    }

    struct Harness {
        engine: Arc<Mutex<FloodEngine>>,
        table: Arc<SharedRoutingTable>,
        consumer: LinkStateConsumer,
        tx: mpsc::UnboundedSender<LinkStateEvent>,
    }

    fn harness(ports: BTreeMap<String, u16>) -> Harness {
        let engine = Arc::new(Mutex::new(FloodEngine::new(n(1), links(&[(2, 1)]))));
        let table = Arc::new(SharedRoutingTable::new(n(1)));
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let flooder = Flooder::new(
            Connector::default(),
            Arc::new(ports),
            RetryPolicy::bounded(2, Duration::from_millis(1), Duration::from_millis(1)),
            shutdown_tx.clone(),
        );
        let consumer = LinkStateConsumer::new(Arc::clone(&engine), Arc::clone(&table), flooder, rx, shutdown_tx);
        Harness {
            engine,
            table,
            consumer,
            tx,
        }
    }

    #[tokio::test]
    async fn test_batch_publishes_one_table() {
        let h = harness(BTreeMap::new());
        let batch = vec![
            LinkStateEvent::Remote(LinkStateRecord::new(&n(2), 1, links(&[(1, 1), (3, 1)]))),
            LinkStateEvent::Remote(LinkStateRecord::new(&n(3), 1, links(&[(2, 1)]))),
        ];
        h.consumer.apply(batch, false).unwrap();

        let table = h.table.snapshot();
        assert_eq!(table.get("n3").map(|e| e.distance), Some(2));
        assert_eq!(table.next_hop("n3"), Some(&n(2)));
        assert!(!h.table.is_recomputing());
        drop(h.tx);
    }

    #[tokio::test]
    async fn test_stale_batch_leaves_table_alone() {
        let h = harness(BTreeMap::new());
        h.consumer
            .apply(vec![LinkStateEvent::Remote(LinkStateRecord::new(&n(2), 4, links(&[(1, 1)])))], false)
            .unwrap();
        let before = h.table.snapshot();

        h.consumer
            .apply(vec![LinkStateEvent::Remote(LinkStateRecord::new(&n(2), 4, links(&[(1, 9)])))], false)
            .unwrap();
        assert!(Arc::ptr_eq(&before, &h.table.snapshot()));
    }

    #[tokio::test]
    async fn test_local_change_bumps_sequence() {
        let h = harness(BTreeMap::new());
        h.consumer
            .apply(vec![LinkStateEvent::LocalChange(links(&[(2, 1), (4, 3)]))], false)
            .unwrap();
        assert_eq!(h.engine.lock().sequence(), 1);
        assert_eq!(h.table.snapshot().get("n4").map(|e| e.distance), Some(3));

        h.consumer.apply(vec![LinkStateEvent::Reoriginate], false).unwrap();
        assert_eq!(h.engine.lock().sequence(), 2);
    }

    #[tokio::test]
    async fn test_updates_flooded_to_neighbors() {
        let listener = PacketListener::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let (sink, mut received) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        tokio::spawn(listener.run(Arc::new(sink), stop_rx));

        let h = harness(BTreeMap::from([("n2".to_string(), port)]));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let tx = h.tx.clone();
        let handle = h.consumer.spawn(shutdown_rx);

        tx.send(LinkStateEvent::Reoriginate).unwrap();
        match received.recv().await.unwrap() {
            WirePacket::LinkState(record) => {
                assert_eq!(record.source_name, "n1");
                assert_eq!(record.sequence, 1);
                assert_eq!(record.neighbors, links(&[(2, 1)]));
            }
            other => panic!("unexpected {:?}", other.kind()),
        }

        // A record from n2 is flooded back to n2 as well
        tx.send(LinkStateEvent::Remote(LinkStateRecord::new(&n(2), 1, links(&[(1, 1)]))))
            .unwrap();
        match received.recv().await.unwrap() {
            WirePacket::LinkState(record) => assert_eq!(record.source_name, "n2"),
            other => panic!("unexpected {:?}", other.kind()),
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        let _ = stop_tx.send(());
    }

    #[tokio::test]
    async fn test_unchanged_recheck_is_ignored() {
        let h = harness(BTreeMap::new());
        h.consumer.apply(vec![LinkStateEvent::Reoriginate], false).unwrap();
        let before = h.table.snapshot();

        h.consumer
            .apply(vec![LinkStateEvent::Recheck(links(&[(2, 1)]))], false)
            .unwrap();
        assert_eq!(h.engine.lock().sequence(), 1);
        assert!(Arc::ptr_eq(&before, &h.table.snapshot()));

        h.consumer
            .apply(vec![LinkStateEvent::Recheck(links(&[(2, 5)]))], false)
            .unwrap();
        assert_eq!(h.engine.lock().sequence(), 2);
        assert_eq!(h.table.snapshot().get("n2").map(|e| e.distance), Some(5));
    }

    #[tokio::test]
    async fn test_only_fatal_errors_stop_the_node() {
        let h = harness(BTreeMap::new());
        let mut shutdown = h.consumer.shutdown_tx.subscribe();

        assert!(!h.consumer.should_stop(&RoutingError::UnknownNode("n9".into())));
        assert!(shutdown.try_recv().is_err());

        assert!(h.consumer.should_stop(&RoutingError::InvariantViolation { node: "n2".into() }));
        assert!(shutdown.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_missing_port_skipped() {
        let h = harness(BTreeMap::new());
        // Must not panic or block
        h.consumer.apply(vec![LinkStateEvent::Reoriginate], true).unwrap();
        assert_eq!(h.engine.lock().sequence(), 1);
    }
}
