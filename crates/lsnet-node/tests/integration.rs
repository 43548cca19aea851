//! Integration tests for OverlayNode
//!
//! Runs small overlays of real nodes on localhost and checks convergence,
//! message delivery, ping, traceroute, and fragmentation end to end.

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep, timeout};

use lsnet_core::{Cost, NodeAddr};
use lsnet_node::{DeliveryEvent, NodeConfig, NodeError, OverlayNode, RetryPolicy, StaticTopology};
use lsnet_transport::ConnectionConfig;

const WAIT: Duration = Duration::from_secs(10);

fn addr(name: &str) -> NodeAddr {
    NodeAddr::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn topology(hosts: &[&str], links: &[(&str, &str, Cost)]) -> StaticTopology {
    let mut topology = StaticTopology::new();
    for host in hosts {
        topology = topology.with_port(*host, free_port());
    }
    for (a, b, cost) in links {
        topology = topology.with_link(addr(a), addr(b), *cost);
    }
    topology
}

fn node_config(name: &str, topology: &StaticTopology) -> NodeConfig {
    let port = topology.port_of(name).unwrap();
    NodeConfig::new(addr(name), port)
        .with_topology(topology.clone())
        .with_update_interval(Duration::from_millis(200))
        .with_reannounce_interval(Duration::from_millis(200))
        .with_ping_timeout(Duration::from_secs(5))
        .with_flood_retry(RetryPolicy::bounded(10, Duration::from_millis(20), Duration::from_millis(200)))
        .with_connection_retry(RetryPolicy::bounded(10, Duration::from_millis(20), Duration::from_millis(200)))
        .with_no_route_retry(RetryPolicy::bounded(3, Duration::from_millis(20), Duration::from_millis(100)))
        .with_connection(ConnectionConfig::default().with_connect_timeout(Duration::from_millis(500)))
}

async fn start_all(configs: Vec<NodeConfig>) -> Vec<Arc<OverlayNode>> {
    let mut nodes = Vec::new();
    for config in configs {
        let node = Arc::new(OverlayNode::new(config).unwrap());
        node.start().await.unwrap();
        nodes.push(node);
    }
    nodes
}

async fn stop_all(nodes: &[Arc<OverlayNode>]) {
    for node in nodes {
        node.stop().await.unwrap();
    }
}

/// Poll until `node` routes to `destination` at `distance`
async fn wait_for_route(node: &OverlayNode, destination: &str, distance: Cost) {
    let deadline = Instant::now() + WAIT;
    loop {
        let table = node.current_routing_table();
        if table.get(destination).is_some_and(|entry| entry.distance == distance) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} never learned a route to {destination} at distance {distance}:\n{}",
            node.local(),
            table.to_csv()
        );
        sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for the first delivery event matching `pred`
async fn next_matching<F>(rx: &mut broadcast::Receiver<DeliveryEvent>, mut pred: F) -> DeliveryEvent
where
    F: FnMut(&DeliveryEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("delivery channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for delivery")
}

fn line() -> StaticTopology {
    topology(&["n1", "n2", "n3"], &[("n1", "n2", 1), ("n2", "n3", 1)])
}

#[tokio::test]
async fn test_line_converges() {
    let topology = line();
    let nodes = start_all(
        ["n1", "n2", "n3"].iter().map(|n| node_config(n, &topology)).collect(),
    )
    .await;

    wait_for_route(&nodes[0], "n3", 2).await;
    wait_for_route(&nodes[2], "n1", 2).await;

    let table = nodes[0].current_routing_table();
    assert_eq!(table.next_hop("n3").unwrap().name, "n2");
    assert_eq!(table.next_hop("n2").unwrap().name, "n2");
    assert_eq!(table.get("n1").unwrap().distance, 0);

    stop_all(&nodes).await;
}

#[tokio::test]
async fn test_message_crosses_two_hops() {
    let topology = line();
    let nodes = start_all(
        ["n1", "n2", "n3"].iter().map(|n| node_config(n, &topology)).collect(),
    )
    .await;
    wait_for_route(&nodes[0], "n3", 2).await;
    wait_for_route(&nodes[1], "n1", 1).await;
    wait_for_route(&nodes[2], "n1", 2).await;

    let mut received = nodes[2].deliveries();
    nodes[0].send_message("n3", "hello across the overlay").await.unwrap();

    let event = next_matching(&mut received, |e| matches!(e, DeliveryEvent::Message { .. })).await;
    let DeliveryEvent::Message { from, text } = event else { unreachable!() };
    assert_eq!(from, "n1");
    assert_eq!(text, "hello across the overlay");

    stop_all(&nodes).await;
}

#[tokio::test]
async fn test_ping_and_traceroute() {
    let topology = line();
    let nodes = start_all(
        ["n1", "n2", "n3"].iter().map(|n| node_config(n, &topology)).collect(),
    )
    .await;
    for node in &nodes {
        for other in ["n1", "n2", "n3"] {
            let expected = match (node.local().name.as_str(), other) {
                (a, b) if a == b => 0,
                ("n1", "n3") | ("n3", "n1") => 2,
                _ => 1,
            };
            wait_for_route(node, other, expected).await;
        }
    }

    let mut events = nodes[0].deliveries();
    let id = nodes[0].ping("n3").await.unwrap();
    let reply = next_matching(&mut events, |e| {
        matches!(e, DeliveryEvent::PingReply { .. } | DeliveryEvent::PingTimeout { .. })
    })
    .await;
    match reply {
        DeliveryEvent::PingReply { from, sequence, .. } => {
            assert_eq!(from, "n3");
            assert_eq!(sequence, id.sequence);
        }
        other => panic!("expected ping reply, got {other:?}"),
    }

    nodes[0].traceroute("n3").await.unwrap();
    let trace = next_matching(&mut events, |e| matches!(e, DeliveryEvent::Traceroute { .. })).await;
    let DeliveryEvent::Traceroute { destination, hops, hop_count } = trace else { unreachable!() };
    assert_eq!(destination, "n3");
    assert_eq!(hop_count, 2);
    let names: Vec<_> = hops.iter().map(|h| h.hostname.as_str()).collect();
    assert_eq!(names, ["n1", "n2", "n3"]);
    assert_eq!(hops.iter().map(|h| h.hop).collect::<Vec<_>>(), [0, 1, 2]);

    stop_all(&nodes).await;
}

#[tokio::test]
async fn test_large_message_is_fragmented_and_reassembled() {
    let topology = line();
    let nodes = start_all(
        ["n1", "n2", "n3"]
            .iter()
            .map(|n| node_config(n, &topology).with_max_packet_size(16))
            .collect(),
    )
    .await;
    wait_for_route(&nodes[0], "n3", 2).await;
    wait_for_route(&nodes[1], "n3", 1).await;

    let text: String = (0..40).map(|i| format!("chunk-{i} ünïcødé ")).collect();
    let mut received = nodes[2].deliveries();
    nodes[0].send_message("n3", text.clone()).await.unwrap();

    let event = next_matching(&mut received, |e| {
        matches!(e, DeliveryEvent::Message { .. } | DeliveryEvent::PartialDelivery { .. })
    })
    .await;
    match event {
        DeliveryEvent::Message { from, text: got } => {
            assert_eq!(from, "n1");
            assert_eq!(got, text);
        }
        other => panic!("expected reassembled message, got {other:?}"),
    }

    stop_all(&nodes).await;
}

#[tokio::test]
async fn test_unreachable_destination_is_reported() {
    // n3 and n4 are never started, so nothing routes to them
    let topology = topology(&["n1", "n2", "n3", "n4"], &[("n1", "n2", 1), ("n3", "n4", 1)]);
    let nodes = start_all(
        ["n1", "n2"].iter().map(|n| node_config(n, &topology)).collect(),
    )
    .await;
    wait_for_route(&nodes[0], "n2", 1).await;

    let mut events = nodes[0].deliveries();
    let id = nodes[0].send_message("n3", "anyone there?").await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, DeliveryEvent::Undeliverable { .. })).await;
    let DeliveryEvent::Undeliverable { id: reported, destination, .. } = event else { unreachable!() };
    assert_eq!(reported, id);
    assert_eq!(destination.as_deref(), Some("n3"));

    stop_all(&nodes).await;
}

#[tokio::test]
async fn test_dump_table_after_convergence() {
    let topology = line();
    let nodes = start_all(
        ["n1", "n2", "n3"].iter().map(|n| node_config(n, &topology)).collect(),
    )
    .await;
    wait_for_route(&nodes[0], "n3", 2).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("n1.csv");
    nodes[0].dump_table(&path).await.unwrap();

    let csv = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<_> = csv.lines().collect();
    assert_eq!(lines[0], "source,destination,next_hop,distance");
    assert_eq!(&lines[1..], ["n1,n1,n1,0", "n1,n2,n2,1", "n1,n3,n2,2"]);

    stop_all(&nodes).await;
}

#[tokio::test]
async fn test_stopped_node_rejects_commands() {
    let topology = line();
    let node = OverlayNode::new(node_config("n1", &topology)).unwrap();
    node.start().await.unwrap();
    assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

    node.stop().await.unwrap();
    assert!(!node.is_started());
    assert!(matches!(node.stop().await, Err(NodeError::NotStarted)));
    assert!(matches!(node.trigger_force_update().await, Err(NodeError::NotStarted)));
}
