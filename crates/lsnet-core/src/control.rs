//! Typed control messages
//!
//! A [`ControlPacket`](crate::ControlPacket) carries its payload as free-form
//! JSON plus a `type` discriminator. [`ControlMessage`] is the typed view of
//! that pair: one variant per kind the node understands, and
//! [`ControlMessage::Opaque`] for kinds whose business logic lives outside
//! the routing core.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// The `type` discriminator of a control packet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Traceroute,
    Ping,
    SendMessage,
    Ftp,
    ClockSync,
    Tor,
    Advertise,
    Other(String),
}

impl ControlKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            ControlKind::Traceroute => "TRACEROUTE",
            ControlKind::Ping => "PING",
            ControlKind::SendMessage => "SNDMSG",
            ControlKind::Ftp => "FTP",
            ControlKind::ClockSync => "CLOCKSYNC",
            ControlKind::Tor => "TOR",
            ControlKind::Advertise => "ADVERTISE",
            ControlKind::Other(name) => name,
        }
    }

    /// Parse a wire name; unknown names are kept verbatim
    pub fn parse(kind: &str) -> Self {
        match kind {
            "TRACEROUTE" => ControlKind::Traceroute,
            "PING" => ControlKind::Ping,
            "SNDMSG" => ControlKind::SendMessage,
            "FTP" => ControlKind::Ftp,
            "CLOCKSYNC" => ControlKind::ClockSync,
            "TOR" => ControlKind::Tor,
            "ADVERTISE" => ControlKind::Advertise,
            other => ControlKind::Other(other.to_string()),
        }
    }
}

impl Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a TRACEROUTE message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceroutePayload {
    /// One `"<hop> <hostname> <hop_ms>"` line per visited node
    #[serde(default)]
    pub data: String,
    #[serde(rename = "HOPCOUNT", default)]
    pub hop_count: u32,
    /// Node time (ms) at the previous hop
    #[serde(default)]
    pub last_hop_time: u64,
    /// Set once the trace reached its destination and is heading home
    #[serde(default)]
    pub complete: bool,
}

/// Payload of a PING message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingPayload {
    /// Node time (ms) at which the ping left its origin
    #[serde(default)]
    pub sent_at: u64,
    /// Whether this is the echo travelling back
    #[serde(default)]
    pub reply: bool,
}

/// Payload of a SNDMSG message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextPayload {
    pub message: String,
}

/// Typed view of a control packet's payload
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Traceroute(TraceroutePayload),
    Ping(PingPayload),
    SendMessage(TextPayload),
    /// Kinds interpreted outside the routing core
    Opaque { kind: ControlKind, payload: Value },
}

impl ControlMessage {
    /// Decode from the wire discriminator and payload
    pub fn decode(kind: &str, payload: &Value) -> Result<Self, ProtocolError> {
        let invalid = |e: serde_json::Error| ProtocolError::InvalidControlPayload {
            kind: kind.to_string(),
            reason: e.to_string(),
        };
        let kind = ControlKind::parse(kind);
        Ok(match kind {
            ControlKind::Traceroute => {
                ControlMessage::Traceroute(serde_json::from_value(payload.clone()).map_err(invalid)?)
            }
            ControlKind::Ping => {
                ControlMessage::Ping(serde_json::from_value(payload.clone()).map_err(invalid)?)
            }
            ControlKind::SendMessage => ControlMessage::SendMessage(
                serde_json::from_value(payload.clone()).map_err(invalid)?,
            ),
            kind => ControlMessage::Opaque {
                kind,
                payload: payload.clone(),
            },
        })
    }

    /// The kind of this message
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Traceroute(_) => ControlKind::Traceroute,
            ControlMessage::Ping(_) => ControlKind::Ping,
            ControlMessage::SendMessage(_) => ControlKind::SendMessage,
            ControlMessage::Opaque { kind, .. } => kind.clone(),
        }
    }

    /// Split into the wire discriminator and payload
    pub fn into_parts(self) -> Result<(String, Value), ProtocolError> {
        let kind = self.kind().to_string();
        let payload = match self {
            ControlMessage::Traceroute(p) => serde_json::to_value(p)?,
            ControlMessage::Ping(p) => serde_json::to_value(p)?,
            ControlMessage::SendMessage(p) => serde_json::to_value(p)?,
            ControlMessage::Opaque { payload, .. } => payload,
        };
        Ok((kind, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names() {
        for name in ["TRACEROUTE", "PING", "SNDMSG", "FTP", "CLOCKSYNC", "TOR", "ADVERTISE"] {
            assert_eq!(ControlKind::parse(name).as_str(), name);
        }
        assert_eq!(
            ControlKind::parse("CUSTOM"),
            ControlKind::Other("CUSTOM".to_string())
        );
    }

    #[test]
    fn test_decode_traceroute_uses_wire_names() {
        let payload = json!({"data": "0 n1 0\n", "HOPCOUNT": 2, "last_hop_time": 10, "complete": false});
        let msg = ControlMessage::decode("TRACEROUTE", &payload).unwrap();
        let ControlMessage::Traceroute(trace) = msg else {
            panic!("expected traceroute");
        };
        assert_eq!(trace.hop_count, 2);
        assert_eq!(trace.data, "0 n1 0\n");
    }

    #[test]
    fn test_decode_invalid_payload() {
        let err = ControlMessage::decode("SNDMSG", &json!({"text": 1})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidControlPayload { ref kind, .. } if kind == "SNDMSG"));
    }

    #[test]
    fn test_opaque_kinds_keep_payload() {
        let payload = json!({"file_name": "a.txt", "size": 3});
        let msg = ControlMessage::decode("FTP", &payload).unwrap();
        assert_eq!(msg.kind(), ControlKind::Ftp);

        let (kind, back) = msg.into_parts().unwrap();
        assert_eq!(kind, "FTP");
        assert_eq!(back, payload);
    }

    #[test]
    fn test_into_parts_ping() {
        let (kind, payload) = ControlMessage::Ping(PingPayload {
            sent_at: 42,
            reply: true,
        })
        .into_parts()
        .unwrap();
        assert_eq!(kind, "PING");
        assert_eq!(payload["sent_at"], 42);
        assert_eq!(payload["reply"], true);
    }
}
