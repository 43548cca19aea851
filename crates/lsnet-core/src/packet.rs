//! Wire packets exchanged between nodes
//!
//! Every packet travels as a single JSON object terminated by a newline over
//! a freshly opened TCP connection. The `packet_type` field tells the two
//! kinds apart:
//!
//! - `"LSP"`: a [`LinkStateRecord`] describing one node's neighbor costs
//! - `"CMP"`: a [`ControlPacket`] carrying an application payload

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::ControlMessage;
use crate::error::ProtocolError;
use crate::identity::{Cost, NodeAddr};

/// Largest random sequence number assigned to a new control packet
const MAX_RANDOM_SEQUENCE: u64 = 2_400_000;

/// Discriminates the two packet families on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Link-state record
    LinkState,
    /// Control/data envelope
    Control,
}

impl PacketKind {
    /// The `packet_type` tag used on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            PacketKind::LinkState => "LSP",
            PacketKind::Control => "CMP",
        }
    }
}

/// A packet as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "packet_type")]
pub enum WirePacket {
    #[serde(rename = "LSP")]
    LinkState(LinkStateRecord),
    #[serde(rename = "CMP")]
    Control(ControlPacket),
}

impl WirePacket {
    /// Which family this packet belongs to
    pub fn kind(&self) -> PacketKind {
        match self {
            WirePacket::LinkState(_) => PacketKind::LinkState,
            WirePacket::Control(_) => PacketKind::Control,
        }
    }

    /// Serialize to a single JSON line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one JSON line
    ///
    /// The tag is inspected first so that an unknown `packet_type` is
    /// reported as such rather than as a generic JSON error.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim())?;
        let tag = value
            .get("packet_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidMessageFormat("missing packet_type".into()))?;
        match tag {
            "LSP" | "CMP" => Ok(serde_json::from_value(value)?),
            other => Err(ProtocolError::UnknownPacketType(other.to_string())),
        }
    }
}

impl From<LinkStateRecord> for WirePacket {
    fn from(record: LinkStateRecord) -> Self {
        WirePacket::LinkState(record)
    }
}

impl From<ControlPacket> for WirePacket {
    fn from(packet: ControlPacket) -> Self {
        WirePacket::Control(packet)
    }
}

/// A link-state record (LSP)
///
/// Describes the full neighbor set of `source` at sequence number
/// `sequence`. Sequence numbers are monotonic per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStateRecord {
    /// Hostname of the originating node
    pub source_name: String,
    /// Ip of the originating node
    pub source_ip: IpAddr,
    /// Monotonic sequence number of the origin
    #[serde(rename = "seq_numb")]
    pub sequence: u64,
    /// Neighbor -> link cost
    #[serde(with = "neighbor_keys")]
    pub neighbors: BTreeMap<NodeAddr, Cost>,
    /// Origin's public key material, opaque to routing
    #[serde(default)]
    pub key: Option<String>,
}

impl LinkStateRecord {
    /// Create a new link-state record
    pub fn new(source: &NodeAddr, sequence: u64, neighbors: BTreeMap<NodeAddr, Cost>) -> Self {
        Self {
            source_name: source.name.clone(),
            source_ip: source.ip,
            sequence,
            neighbors,
            key: None,
        }
    }

    /// Attach public key material
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// The originating node
    pub fn source(&self) -> NodeAddr {
        NodeAddr::new(self.source_name.clone(), self.source_ip)
    }
}

/// Serde adapter for the LSP neighbor map.
///
/// On the wire each key is the JSON encoding of a `[host, ip]` pair, e.g.
/// `{"[\"n2\",\"10.0.0.2\"]": 1}`.
mod neighbor_keys {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::identity::{Cost, NodeAddr};

    pub fn serialize<S: Serializer>(
        neighbors: &BTreeMap<NodeAddr, Cost>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut encoded = BTreeMap::new();
        for (addr, cost) in neighbors {
            let key = serde_json::to_string(&(&addr.name, addr.ip.to_string()))
                .map_err(S::Error::custom)?;
            encoded.insert(key, *cost);
        }
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<NodeAddr, Cost>, D::Error> {
        let encoded = BTreeMap::<String, Cost>::deserialize(deserializer)?;
        let mut neighbors = BTreeMap::new();
        for (key, cost) in encoded {
            let (name, ip): (String, String) = serde_json::from_str(&key)
                .map_err(|e| D::Error::custom(format!("neighbor key {key}: {e}")))?;
            let addr = NodeAddr::parse(&name, &ip)
                .map_err(|e| D::Error::custom(format!("neighbor key {key}: {e}")))?;
            neighbors.insert(addr, cost);
        }
        Ok(neighbors)
    }
}

/// Fragmentation metadata of a control packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FragInfo {
    /// 1-based position of this fragment; 0 when not fragmented
    #[serde(rename = "fragId")]
    pub fragment_id: u32,
    /// Whether this packet is one fragment of a larger payload
    pub fragmented: bool,
    /// Whether this is the final fragment
    pub last: bool,
}

impl FragInfo {
    /// Metadata for the fragment at `fragment_id`
    pub fn fragment(fragment_id: u32, last: bool) -> Self {
        Self {
            fragment_id,
            fragmented: true,
            last,
        }
    }
}

/// Identifies one control packet (and all of its fragments)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId {
    /// Hostname of the packet's source
    pub source: String,
    /// Sequence number assigned by the source
    pub sequence: u64,
}

impl Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.source, self.sequence)
    }
}

/// A control/data envelope (CMP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPacket {
    /// Hostname of the sender
    pub source_name: String,
    /// Ip of the sender
    pub source_ip: IpAddr,
    /// Sequence number chosen by the sender
    #[serde(rename = "seq_numb")]
    pub sequence: u64,
    /// Control message kind (`TRACEROUTE`, `PING`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload, opaque to forwarding
    pub payload: Value,
    /// Final destination; `None` means local delivery only
    #[serde(default)]
    pub destination_name: Option<String>,
    #[serde(default)]
    pub destination_ip: Option<IpAddr>,
    /// Sender's node time in seconds
    #[serde(default)]
    pub time_sent: f64,
    /// Onion-routing material, opaque to forwarding
    #[serde(default)]
    pub encryption: Option<Value>,
    #[serde(rename = "fragInfo", default)]
    pub frag_info: FragInfo,
    /// Set when the packet could not be routed and was returned to its source
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bounced: bool,
    /// Local delivery attempts; never leaves the node
    #[serde(skip)]
    pub attempts: u32,
}

impl ControlPacket {
    /// Create a new control packet with a random sequence number
    pub fn new(
        source: &NodeAddr,
        destination: Option<&NodeAddr>,
        kind: impl Into<String>,
        payload: Value,
        time_sent: f64,
    ) -> Self {
        Self {
            source_name: source.name.clone(),
            source_ip: source.ip,
            sequence: rand::random_range(1..=MAX_RANDOM_SEQUENCE),
            kind: kind.into(),
            payload,
            destination_name: destination.map(|d| d.name.clone()),
            destination_ip: destination.map(|d| d.ip),
            time_sent,
            encryption: None,
            frag_info: FragInfo::default(),
            bounced: false,
            attempts: 0,
        }
    }

    /// Build a packet from a typed control message
    pub fn from_message(
        source: &NodeAddr,
        destination: Option<&NodeAddr>,
        message: ControlMessage,
        time_sent: f64,
    ) -> Result<Self, ProtocolError> {
        let (kind, payload) = message.into_parts()?;
        Ok(Self::new(source, destination, kind, payload, time_sent))
    }

    /// Override the sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// The sending node
    pub fn source(&self) -> NodeAddr {
        NodeAddr::new(self.source_name.clone(), self.source_ip)
    }

    /// Identifier shared by a packet and all of its fragments
    pub fn id(&self) -> PacketId {
        PacketId {
            source: self.source_name.clone(),
            sequence: self.sequence,
        }
    }

    /// Whether this packet is a fragment of a larger payload
    pub fn is_fragment(&self) -> bool {
        self.frag_info.fragmented
    }

    /// Whether this packet is addressed to `hostname` (or has no destination)
    pub fn is_for(&self, hostname: &str) -> bool {
        match &self.destination_name {
            Some(dest) => dest == hostname,
            None => true,
        }
    }

    /// Size in bytes of the serialized payload
    pub fn payload_len(&self) -> Result<usize, ProtocolError> {
        Ok(serde_json::to_string(&self.payload)?.len())
    }

    /// Decode the payload into a typed control message
    pub fn message(&self) -> Result<ControlMessage, ProtocolError> {
        ControlMessage::decode(&self.kind, &self.payload)
    }

    /// Re-address this packet back to its own source
    ///
    /// Used when the destination is unreachable from `local`.
    pub fn bounce(&mut self, local: &NodeAddr) {
        self.destination_name = Some(std::mem::replace(&mut self.source_name, local.name.clone()));
        self.destination_ip = Some(std::mem::replace(&mut self.source_ip, local.ip));
        self.bounced = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(name: &str, ip: &str) -> NodeAddr {
        NodeAddr::parse(name, ip).unwrap()
    }

    #[test]
    fn test_lsp_wire_shape() {
        let mut neighbors = BTreeMap::new();
        neighbors.insert(addr("n2", "10.0.0.2"), 4);
        let record = LinkStateRecord::new(&addr("n1", "10.0.0.1"), 7, neighbors).with_key("pk");

        let line = WirePacket::from(record.clone()).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["packet_type"], "LSP");
        assert_eq!(value["source_name"], "n1");
        assert_eq!(value["source_ip"], "10.0.0.1");
        assert_eq!(value["seq_numb"], 7);
        assert_eq!(value["neighbors"]["[\"n2\",\"10.0.0.2\"]"], 4);
        assert_eq!(value["key"], "pk");

        assert_eq!(WirePacket::from_line(&line).unwrap(), WirePacket::LinkState(record));
    }

    #[test]
    fn test_cmp_wire_shape() {
        let packet = ControlPacket::new(
            &addr("n1", "10.0.0.1"),
            Some(&addr("n3", "10.0.0.3")),
            "SNDMSG",
            json!({"message": "hi"}),
            12.5,
        )
        .with_sequence(99);

        let line = WirePacket::from(packet.clone()).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["packet_type"], "CMP");
        assert_eq!(value["type"], "SNDMSG");
        assert_eq!(value["seq_numb"], 99);
        assert_eq!(value["destination_name"], "n3");
        assert_eq!(value["fragInfo"]["fragId"], 0);
        assert_eq!(value["fragInfo"]["fragmented"], false);
        assert!(value.get("bounced").is_none());
        assert!(value.get("attempts").is_none());

        match WirePacket::from_line(&line).unwrap() {
            WirePacket::Control(decoded) => assert_eq!(decoded, packet),
            other => panic!("expected CMP, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_cmp_accepts_empty_frag_info() {
        let line = r#"{"packet_type":"CMP","source_name":"n1","source_ip":"10.0.0.1","seq_numb":5,
            "type":"PING","payload":{},"destination_name":"n2","destination_ip":null,
            "time_sent":1.0,"encryption":null,"fragInfo":{}}"#;
        let WirePacket::Control(packet) = WirePacket::from_line(line).unwrap() else {
            panic!("expected CMP");
        };
        assert!(!packet.is_fragment());
        assert_eq!(packet.destination_ip, None);
    }

    #[test]
    fn test_unknown_packet_type() {
        let err = WirePacket::from_line(r#"{"packet_type":"XYZ"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPacketType(t) if t == "XYZ"));

        let err = WirePacket::from_line(r#"{"source_name":"n1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessageFormat(_)));
    }

    #[test]
    fn test_bad_neighbor_key_rejected() {
        let line = r#"{"packet_type":"LSP","source_name":"n1","source_ip":"10.0.0.1",
            "seq_numb":1,"neighbors":{"n2":1}}"#;
        assert!(WirePacket::from_line(line).is_err());
    }

    #[test]
    fn test_random_sequence_in_range() {
        let packet = ControlPacket::new(&addr("n1", "10.0.0.1"), None, "PING", json!({}), 0.0);
        assert!((1..=MAX_RANDOM_SEQUENCE).contains(&packet.sequence));
        assert!(packet.is_for("anyone"));
    }

    #[test]
    fn test_bounce_swaps_addresses() {
        let mut packet = ControlPacket::new(
            &addr("n1", "10.0.0.1"),
            Some(&addr("n9", "10.0.0.9")),
            "SNDMSG",
            json!({"message": "x"}),
            0.0,
        );
        packet.bounce(&addr("n2", "10.0.0.2"));

        assert!(packet.bounced);
        assert_eq!(packet.source_name, "n2");
        assert_eq!(packet.destination_name.as_deref(), Some("n1"));
        assert!(packet.is_for("n1"));
    }
}
