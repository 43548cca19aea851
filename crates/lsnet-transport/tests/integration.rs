//! Integration tests for lsnet-transport
//!
//! Exercises real localhost TCP connections.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lsnet_core::{ControlPacket, LinkStateRecord, NodeAddr, WirePacket};
use lsnet_transport::{ConnectionConfig, Connector, PacketListener, TransportError};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

fn addr(name: &str, ip: &str) -> NodeAddr {
    NodeAddr::parse(name, ip).unwrap()
}

async fn start_listener() -> (
    std::net::SocketAddr,
    mpsc::UnboundedReceiver<WirePacket>,
    broadcast::Sender<()>,
    tokio::task::JoinHandle<lsnet_transport::TransportResult<()>>,
) {
    let listener = PacketListener::bind("127.0.0.1:0".parse().unwrap(), ConnectionConfig::default())
        .await
        .expect("bind");
    let local = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(listener.run(Arc::new(tx), shutdown_rx));
    (local, rx, shutdown_tx, handle)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<WirePacket>) -> WirePacket {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("sink closed")
}

#[tokio::test]
async fn test_send_and_receive_both_kinds() {
    let (local, mut rx, shutdown, handle) = start_listener().await;
    let connector = Connector::default();

    let n1 = addr("n1", "127.0.0.1");
    let n2 = addr("n2", "127.0.0.2");
    let lsp: WirePacket = LinkStateRecord::new(&n1, 3, BTreeMap::from([(n2.clone(), 4)])).into();
    let cmp: WirePacket =
        ControlPacket::new(&n1, Some(&n2), "SNDMSG", json!({"message": "hello"}), 1.0).into();

    connector.send(local, &lsp).await.unwrap();
    assert_eq!(recv(&mut rx).await, lsp);

    connector.send(local, &cmp).await.unwrap();
    assert_eq!(recv(&mut rx).await, cmp);

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_refused_is_retryable() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let target = format!("127.0.0.1:{port}").parse().unwrap();
    let packet: WirePacket =
        LinkStateRecord::new(&addr("n1", "127.0.0.1"), 1, BTreeMap::new()).into();

    let err = Connector::default().send(target, &packet).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionRefused(a) if a == target));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_malformed_lines_skipped() {
    let (local, mut rx, shutdown, handle) = start_listener().await;

    let good = WirePacket::from(LinkStateRecord::new(
        &addr("n7", "127.0.0.1"),
        9,
        BTreeMap::new(),
    ));
    let mut stream = TcpStream::connect(local).await.unwrap();
    stream.write_all(b"not json\n").await.unwrap();
    stream.write_all(b"{\"packet_type\":\"XYZ\"}\n").await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream
        .write_all(format!("{}\n", good.to_line().unwrap()).as_bytes())
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(recv(&mut rx).await, good);
    assert!(rx.try_recv().is_err());

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (local, _rx, shutdown, handle) = start_listener().await;
    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let packet: WirePacket =
        LinkStateRecord::new(&addr("n1", "127.0.0.1"), 1, BTreeMap::new()).into();
    let err = Connector::default().send(local, &packet).await.unwrap_err();
    assert!(err.is_retryable());
}
