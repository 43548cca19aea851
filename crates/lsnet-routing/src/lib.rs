//! # lsnet Routing
//!
//! Routing layer for the lsnet link-state overlay.
//!
//! Each node keeps its own view of the overlay topology, converges it with
//! the other nodes by flooding link-state records, and derives next hops by
//! running Dijkstra's algorithm over that view.
//!
//! ## Core Components
//!
//! - [`TopologyGraph`]: Weighted undirected graph of known nodes and links
//! - [`RouteComputer`]: Dijkstra shortest-path computation producing a [`RoutingTable`]
//! - [`FloodEngine`]: Applies received link-state records and originates local ones
//! - [`SharedRoutingTable`]: The currently published table, swapped atomically
//!
//! ## Convergence
//!
//! 1. A node originates a record with its neighbor costs and a fresh sequence number
//! 2. Every node applies records newer than the last one seen from that origin
//!    and floods them to all of its neighbors
//! 3. After applying a batch of records the node recomputes its routing table
//!    from scratch and publishes it
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use lsnet_core::{LinkStateRecord, NodeAddr};
//! use lsnet_routing::FloodEngine;
//!
//! let n1 = NodeAddr::parse("n1", "10.0.0.1").unwrap();
//! let n2 = NodeAddr::parse("n2", "10.0.0.2").unwrap();
//! let n3 = NodeAddr::parse("n3", "10.0.0.3").unwrap();
//!
//! let mut engine = FloodEngine::new(n1.clone(), BTreeMap::from([(n2.clone(), 1)]));
//! let record = LinkStateRecord::new(&n2, 1, BTreeMap::from([(n1, 1), (n3, 1)]));
//! assert!(engine.on_receive(record).to_flood().is_some());
//!
//! let table = engine.compute_routes().unwrap();
//! assert_eq!(table.next_hop("n3").map(|h| h.name.as_str()), Some("n2"));
//! ```

pub mod dijkstra;
pub mod error;
pub mod flood;
pub mod graph;
mod heap;
pub mod table;

// Re-export main types
pub use dijkstra::RouteComputer;
pub use error::{RoutingError, RoutingResult};
pub use flood::{FloodEngine, FloodOutcome};
pub use graph::{Edge, Node, TopologyGraph};
pub use table::{ComputingGuard, RouteEntry, RoutingTable, SharedRoutingTable};
