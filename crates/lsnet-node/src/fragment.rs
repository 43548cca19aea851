//! Outbound fragmentation
//!
//! A control packet whose serialized payload is larger than the configured
//! maximum is split into fragments. Each fragment carries one slice of the
//! serialized payload as a JSON string, tagged with a 1-based fragment id;
//! the final fragment has `last` set. All fragments keep the packet's
//! source and sequence number, which is what the receiver reassembles on.

use lsnet_core::{ControlPacket, FragInfo, ProtocolError};
use serde_json::Value;

/// Split `packet` into fragments of at most `max_size` payload bytes
///
/// Packets that fit, and packets that already are fragments, are returned
/// unchanged as a single element.
pub fn fragment(packet: &ControlPacket, max_size: usize) -> Result<Vec<ControlPacket>, ProtocolError> {
    if packet.is_fragment() {
        return Ok(vec![packet.clone()]);
    }
    let serialized = serde_json::to_string(&packet.payload)?;
    if serialized.len() <= max_size {
        return Ok(vec![packet.clone()]);
    }

    let chunks = split_at_char_boundaries(&serialized, max_size.max(1));
    let count = chunks.len();
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut piece = packet.clone();
            piece.payload = Value::String(chunk.to_string());
            piece.frag_info = FragInfo::fragment(i as u32 + 1, i + 1 == count);
            piece
        })
        .collect())
}

/// Slices of at most `max` bytes, never cutting a UTF-8 sequence
///
/// A single character wider than `max` gets a slice of its own.
fn split_at_char_boundaries(s: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::with_capacity(s.len() / max + 1);
    let mut rest = s;
    while !rest.is_empty() {
        let mut end = max.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}
