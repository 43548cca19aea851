//! Link-state flooding
//!
//! The [`FloodEngine`] keeps this node's view of the topology converged. It
//! owns the [`TopologyGraph`], remembers the last applied sequence number of
//! every origin, and decides for each incoming [`LinkStateRecord`] whether it
//! is new information (apply, then flood onward) or a duplicate (drop).
//!
//! Sending is not done here: the engine only says *what* to flood, the
//! node's flooder decides how to reach each neighbor.

use std::collections::{BTreeMap, HashMap};

use lsnet_core::{Cost, LinkStateRecord, NodeAddr};
use tracing::{debug, trace};

use crate::dijkstra::RouteComputer;
use crate::error::RoutingResult;
use crate::graph::TopologyGraph;
use crate::table::RoutingTable;

/// What happened to a received link-state record
#[derive(Debug, Clone, PartialEq)]
pub enum FloodOutcome {
    /// First record ever seen from this origin
    Installed(LinkStateRecord),
    /// Newer record from a known origin
    Updated(LinkStateRecord),
    /// Duplicate or stale record; the graph is unchanged
    Dropped { stored: u64, received: u64 },
}

impl FloodOutcome {
    /// The record to flood onward, if any
    pub fn to_flood(&self) -> Option<&LinkStateRecord> {
        match self {
            FloodOutcome::Installed(record) | FloodOutcome::Updated(record) => Some(record),
            FloodOutcome::Dropped { .. } => None,
        }
    }

    /// Whether the topology graph was modified
    pub fn changed_graph(&self) -> bool {
        self.to_flood().is_some()
    }
}

/// Applies and originates link-state records
#[derive(Debug)]
pub struct FloodEngine {
    local: NodeAddr,
    /// Sequence number of the last locally originated record
    sequence: u64,
    last_applied: HashMap<String, u64>,
    local_links: BTreeMap<NodeAddr, Cost>,
    graph: TopologyGraph,
    key: Option<String>,
}

impl FloodEngine {
    /// Create an engine whose graph holds the local node and its links
    pub fn new(local: NodeAddr, local_links: BTreeMap<NodeAddr, Cost>) -> Self {
        let mut graph = TopologyGraph::new();
        graph.add_node(local.clone());
        graph.replace_sub_topology(&local, &local_links);
        Self {
            local,
            sequence: 0,
            last_applied: HashMap::new(),
            local_links,
            graph,
            key: None,
        }
    }

    /// Attach public key material to every originated record
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Apply a record received from the network
    pub fn on_receive(&mut self, record: LinkStateRecord) -> FloodOutcome {
        if record.source_name == self.local.name {
            // Our own record came back around. Never let a remote copy
            // overwrite the local view; just make sure our next origination
            // outranks it.
            self.sequence = self.sequence.max(record.sequence);
            return FloodOutcome::Dropped {
                stored: self.sequence,
                received: record.sequence,
            };
        }

        let source = record.source();
        match self.last_applied.get(&record.source_name).copied() {
            None => {
                debug!(source = %source, seq = record.sequence, neighbors = record.neighbors.len(), "installing link state");
                self.last_applied.insert(record.source_name.clone(), record.sequence);
                self.graph.add_node_with_neighbors(source, &record.neighbors);
                FloodOutcome::Installed(record)
            }
            Some(stored) if record.sequence > stored => {
                debug!(source = %source, seq = record.sequence, stored, "updating link state");
                self.last_applied.insert(record.source_name.clone(), record.sequence);
                self.graph.replace_sub_topology(&source, &record.neighbors);
                FloodOutcome::Updated(record)
            }
            Some(stored) => {
                trace!(source = %source, seq = record.sequence, stored, "dropping stale link state");
                FloodOutcome::Dropped {
                    stored,
                    received: record.sequence,
                }
            }
        }
    }

    /// Replace the local neighbor set and originate a record for it
    pub fn on_local_topology_change(&mut self, links: BTreeMap<NodeAddr, Cost>) -> LinkStateRecord {
        self.local_links = links;
        self.originate()
    }

    /// Originate a record for the current local neighbor set
    pub fn originate(&mut self) -> LinkStateRecord {
        self.sequence += 1;
        self.graph.replace_sub_topology(&self.local, &self.local_links);
        debug!(seq = self.sequence, neighbors = self.local_links.len(), "originating link state");

        let record = LinkStateRecord::new(&self.local, self.sequence, self.local_links.clone());
        match &self.key {
            Some(key) => record.with_key(key.clone()),
            None => record,
        }
    }

    /// Recompute the routing table over the current graph
    pub fn compute_routes(&mut self) -> RoutingResult<RoutingTable> {
        RouteComputer::compute(&mut self.graph, &self.local)
    }

    /// Neighbors every record is flooded to
    pub fn flood_targets(&self) -> impl Iterator<Item = &NodeAddr> {
        self.local_links.keys()
    }

    /// Whether `links` differs from the current local neighbor set
    pub fn links_differ(&self, links: &BTreeMap<NodeAddr, Cost>) -> bool {
        &self.local_links != links
    }

    /// The local node
    pub fn local(&self) -> &NodeAddr {
        &self.local
    }

    /// The current local neighbor set
    pub fn local_links(&self) -> &BTreeMap<NodeAddr, Cost> {
        &self.local_links
    }

    /// Sequence number of the last originated record
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Last applied sequence number of `origin`
    pub fn last_applied(&self, origin: &str) -> Option<u64> {
        self.last_applied.get(origin).copied()
    }

    /// The topology graph
    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }
}
