//! Inbound reassembly of fragmented control packets
//!
//! Buffers are keyed by [`PacketId`] (source hostname and sequence number),
//! so fragmented packets from different senders never mix even when their
//! sequence numbers collide. Only the control consumer touches the
//! [`Reassembler`], so it carries no lock.

use std::collections::HashMap;
use std::time::Duration;

use lsnet_core::{ControlPacket, FragInfo, PacketId};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a reassembly buffer was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentationError {
    #[error("expected fragment {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("fragment {got} arrived with no reassembly in progress")]
    NoBuffer { got: u32 },

    #[error("fragment payload is not a string slice")]
    NotAString,

    #[error("reassembled payload is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("restarted by a new first fragment while expecting fragment {expected}")]
    Restarted { expected: u32 },

    #[error("timed out waiting for the remaining fragments")]
    Expired,
}

/// Result of feeding one packet to the [`Reassembler`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyOutcome {
    /// A whole packet, ready for local handling
    Complete(ControlPacket),
    /// A buffer was discarded; whatever was received is reported
    Failed {
        id: PacketId,
        kind: String,
        received_bytes: usize,
        reason: FragmentationError,
    },
}

#[derive(Debug)]
struct ReassemblyBuffer {
    data: String,
    next_id: u32,
    kind: String,
    started: Instant,
}

/// In-progress reassemblies
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<PacketId, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reassemblies in progress
    pub fn in_progress(&self) -> usize {
        self.buffers.len()
    }

    /// Feed one packet
    ///
    /// Unfragmented packets come straight back as `Complete`. An empty
    /// result means the fragment was buffered and more are expected.
    pub fn accept(&mut self, mut packet: ControlPacket) -> Vec<ReassemblyOutcome> {
        if !packet.is_fragment() {
            return vec![ReassemblyOutcome::Complete(packet)];
        }

        let id = packet.id();
        let frag = packet.frag_info;
        let mut outcomes = Vec::new();

        if frag.fragment_id == 1 {
            if let Some(old) = self.buffers.remove(&id) {
                let expected = old.next_id;
                warn!(packet = %id, expected, "reassembly restarted");
                outcomes.push(Self::failed(
                    id.clone(),
                    old,
                    FragmentationError::Restarted { expected },
                ));
            }
            self.buffers.insert(
                id.clone(),
                ReassemblyBuffer {
                    data: String::new(),
                    next_id: 1,
                    kind: packet.kind.clone(),
                    started: Instant::now(),
                },
            );
        }

        let Some(buffer) = self.buffers.get_mut(&id) else {
            debug!(packet = %id, fragment = frag.fragment_id, "fragment without buffer");
            outcomes.push(ReassemblyOutcome::Failed {
                id,
                kind: packet.kind,
                received_bytes: 0,
                reason: FragmentationError::NoBuffer { got: frag.fragment_id },
            });
            return outcomes;
        };

        if frag.fragment_id != buffer.next_id {
            let expected = buffer.next_id;
            warn!(packet = %id, expected, got = frag.fragment_id, "out-of-order fragment");
            if let Some(buffer) = self.buffers.remove(&id) {
                outcomes.push(Self::failed(
                    id,
                    buffer,
                    FragmentationError::OutOfOrder { expected, got: frag.fragment_id },
                ));
            }
            return outcomes;
        }

        let Some(slice) = packet.payload.as_str() else {
            if let Some(buffer) = self.buffers.remove(&id) {
                outcomes.push(Self::failed(id, buffer, FragmentationError::NotAString));
            }
            return outcomes;
        };
        buffer.data.push_str(slice);
        buffer.next_id += 1;

        if !frag.last {
            return outcomes;
        }

        let Some(buffer) = self.buffers.remove(&id) else {
            return outcomes;
        };
        match serde_json::from_str(&buffer.data) {
            Ok(payload) => {
                debug!(packet = %id, bytes = buffer.data.len(), fragments = frag.fragment_id, "reassembled");
                packet.payload = payload;
                packet.frag_info = FragInfo::default();
                outcomes.push(ReassemblyOutcome::Complete(packet));
            }
            Err(e) => {
                warn!(packet = %id, error = %e, "reassembled payload unparsable");
                outcomes.push(Self::failed(id, buffer, FragmentationError::InvalidPayload(e.to_string())));
            }
        }
        outcomes
    }

    /// Discard buffers older than `max_age`
    pub fn expire(&mut self, max_age: Duration) -> Vec<ReassemblyOutcome> {
        let stale: Vec<PacketId> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.started.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                let buffer = self.buffers.remove(&id)?;
                warn!(packet = %id, received = buffer.data.len(), "reassembly expired");
                Some(Self::failed(id, buffer, FragmentationError::Expired))
            })
            .collect()
    }

    /// Discard every buffer, reporting each as expired
    pub fn drain(&mut self) -> Vec<ReassemblyOutcome> {
        self.buffers
            .drain()
            .map(|(id, buffer)| Self::failed(id, buffer, FragmentationError::Expired))
            .collect()
    }

    fn failed(id: PacketId, buffer: ReassemblyBuffer, reason: FragmentationError) -> ReassemblyOutcome {
        ReassemblyOutcome::Failed {
            id,
            kind: buffer.kind,
            received_bytes: buffer.data.len(),
            reason,
        }
    }
}
