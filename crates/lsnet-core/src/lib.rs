//! # lsnet Core
//!
//! Core types, wire packets, and errors for the lsnet link-state overlay.
//!
//! Every other crate in the workspace speaks in terms of the types defined
//! here: the routing crate builds its topology out of [`NodeAddr`] and
//! [`Cost`], the transport crate moves [`WirePacket`]s between processes, and
//! the node crate interprets [`ControlPacket`] payloads as [`ControlMessage`]s.
//!
//! ## Key Types
//!
//! - [`NodeAddr`]: A node's identity on the overlay (hostname + ip)
//! - [`NeighborInfo`]: A directly attached neighbor (address, listening port, link cost)
//! - [`LinkStateRecord`]: An LSP describing one node's neighbor costs
//! - [`ControlPacket`]: A CMP envelope carrying an application payload
//! - [`WirePacket`]: The newline-delimited JSON unit exchanged over TCP
//! - [`ControlMessage`]: Typed view of a control packet's payload

pub mod control;
pub mod error;
pub mod identity;
pub mod packet;

// Re-export main types
pub use control::*;
pub use error::*;
pub use identity::*;
pub use packet::*;
