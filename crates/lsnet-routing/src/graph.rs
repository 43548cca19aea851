//! Topology graph
//!
//! The [`TopologyGraph`] is this node's view of the overlay: a weighted,
//! undirected graph keyed by hostname. Nodes own their adjacency maps and
//! edges refer to the remote node by hostname only, so the structure has a
//! single owner and no reference cycles.
//!
//! Every edge is stored in both directions; no operation can leave an edge
//! present in only one of its endpoints.

use std::collections::BTreeMap;

use lsnet_core::{Cost, NodeAddr};

/// One direction of an undirected link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge<'a> {
    /// Hostname of the remote endpoint
    pub to: &'a str,
    /// Link cost
    pub cost: Cost,
}

/// A node in the topology graph
#[derive(Debug, Clone)]
pub struct Node {
    addr: NodeAddr,
    /// Remote hostname -> link cost
    neighbors: BTreeMap<String, Cost>,
    // Scratch state owned by the route computation; reset on every run.
    pub(crate) distance: Option<Cost>,
    pub(crate) parent: Option<String>,
    pub(crate) next_hop: Option<String>,
}

impl Node {
    fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            neighbors: BTreeMap::new(),
            distance: None,
            parent: None,
            next_hop: None,
        }
    }

    /// The node's address
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// The node's hostname
    pub fn name(&self) -> &str {
        &self.addr.name
    }

    /// Edges leaving this node, ordered by remote hostname
    pub fn edges(&self) -> impl Iterator<Item = Edge<'_>> {
        self.neighbors.iter().map(|(to, cost)| Edge { to, cost: *cost })
    }

    /// Cost of the edge to `to`, if present
    pub fn cost_to(&self, to: &str) -> Option<Cost> {
        self.neighbors.get(to).copied()
    }

    /// Number of neighbors
    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }

    /// Distance from the source of the last route computation
    pub fn distance(&self) -> Option<Cost> {
        self.distance
    }

    /// Predecessor on the shortest path found by the last route computation
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// First hop from the source toward this node
    pub fn next_hop(&self) -> Option<&str> {
        self.next_hop.as_deref()
    }

    fn reset_search_state(&mut self) {
        self.distance = None;
        self.parent = None;
        self.next_hop = None;
    }
}

/// Weighted undirected graph of known nodes and links
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    nodes: BTreeMap<String, Node>,
}

impl TopologyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node if its hostname is not yet known
    ///
    /// Returns `true` if the node was inserted.
    pub fn add_node(&mut self, addr: NodeAddr) -> bool {
        if self.nodes.contains_key(&addr.name) {
            return false;
        }
        self.nodes.insert(addr.name.clone(), Node::new(addr));
        true
    }

    /// Insert a node together with a pre-populated neighbor set
    ///
    /// Used when bootstrapping a node from its link-state record: every
    /// neighbor edge is installed through [`add_edge`](Self::add_edge).
    pub fn add_node_with_neighbors(&mut self, addr: NodeAddr, neighbors: &BTreeMap<NodeAddr, Cost>) {
        self.add_node(addr.clone());
        for (neighbor, cost) in neighbors {
            self.add_edge(&addr, neighbor, *cost);
        }
    }

    /// Install or overwrite the undirected edge `a -- b`
    ///
    /// Endpoints are resolved by hostname, so an already stored node keeps
    /// its identity; unknown endpoints are created. Self-loops are ignored.
    pub fn add_edge(&mut self, a: &NodeAddr, b: &NodeAddr, cost: Cost) {
        if a.name == b.name {
            return;
        }
        self.add_node(a.clone());
        self.add_node(b.clone());
        if let Some(node) = self.nodes.get_mut(&a.name) {
            node.neighbors.insert(b.name.clone(), cost);
        }
        if let Some(node) = self.nodes.get_mut(&b.name) {
            node.neighbors.insert(a.name.clone(), cost);
        }
    }

    /// Remove the undirected edge `a -- b`
    ///
    /// No-op unless both nodes exist.
    pub fn remove_edge(&mut self, a: &str, b: &str) {
        if !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(a) {
            node.neighbors.remove(b);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.neighbors.remove(a);
        }
    }

    /// Replace every edge of `source` with `neighbors`
    ///
    /// All edges currently leaving `source` are removed (in both
    /// directions), then one edge per `(neighbor, cost)` is added. Applying
    /// the same neighbor set twice leaves the graph unchanged.
    pub fn replace_sub_topology(&mut self, source: &NodeAddr, neighbors: &BTreeMap<NodeAddr, Cost>) {
        self.add_node(source.clone());
        let old: Vec<String> = self
            .nodes
            .get(&source.name)
            .map(|n| n.neighbors.keys().cloned().collect())
            .unwrap_or_default();
        for neighbor in old {
            self.remove_edge(&source.name, &neighbor);
        }
        for (neighbor, cost) in neighbors {
            self.add_edge(source, neighbor, *cost);
        }
    }

    /// Look up a node by hostname
    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub(crate) fn get_node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    /// Whether a hostname is known
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Cost of the edge `a -- b`, if present
    pub fn edge_cost(&self, a: &str, b: &str) -> Option<Cost> {
        self.nodes.get(a).and_then(|n| n.cost_to(b))
    }

    /// All nodes, ordered by hostname
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All hostnames, in order
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of undirected edges
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(Node::degree).sum::<usize>() / 2
    }

    /// Whether every edge is present in both directions with equal cost
    pub fn is_symmetric(&self) -> bool {
        self.nodes.values().all(|node| {
            node.edges()
                .all(|e| self.edge_cost(e.to, node.name()) == Some(e.cost))
        })
    }

    /// Clear the scratch state of every node
    pub(crate) fn reset_search_state(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset_search_state();
        }
    }
}
