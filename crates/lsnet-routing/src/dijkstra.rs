//! Shortest-path route computation
//!
//! [`RouteComputer::compute`] runs Dijkstra's algorithm over the whole
//! [`TopologyGraph`] from a full reset every time. Next hops are derived
//! from completion order: a node whose parent is the source is its own next
//! hop, any other node inherits its parent's next hop (the parent is always
//! completed first).

use std::collections::HashMap;

use lsnet_core::{Cost, NodeAddr};
use tracing::{debug, instrument};

use crate::error::{RoutingError, RoutingResult};
use crate::graph::TopologyGraph;
use crate::heap::IndexedMinHeap;
use crate::table::{RouteEntry, RoutingTable};

/// Computes routing tables from a topology graph
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteComputer;

impl RouteComputer {
    /// Compute the routing table of `source` over `graph`
    ///
    /// Overwrites the scratch state of every node in `graph`. Unreachable
    /// nodes are left out of the table. A source missing from the graph
    /// yields a table holding only the self-entry.
    #[instrument(level = "debug", skip_all, fields(source = %source.name, nodes = graph.len()))]
    pub fn compute(graph: &mut TopologyGraph, source: &NodeAddr) -> RoutingResult<RoutingTable> {
        graph.reset_search_state();
        let mut table = RoutingTable::new(source.clone());

        let names = graph.names();
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let Some(&src) = index.get(source.name.as_str()) else {
            debug!("source not in topology graph, only self-entry");
            return Ok(table);
        };

        let mut keys = vec![None; names.len()];
        keys[src] = Some(0);
        let mut heap = IndexedMinHeap::from_keys(keys);
        let mut completed = vec![false; names.len()];
        if let Some(node) = graph.get_node_mut(&source.name) {
            node.distance = Some(0);
        }

        while let Some((u, distance)) = heap.pop_min() {
            let Some(distance) = distance else {
                let mut unreachable = vec![names[u].as_str()];
                while let Some((v, _)) = heap.pop_min() {
                    unreachable.push(names[v].as_str());
                }
                debug!(?unreachable, "nodes unreachable from source");
                break;
            };
            completed[u] = true;
            let name = &names[u];

            if u != src {
                let entry = Self::complete(graph, source, name, distance)?;
                table.insert(entry);
            }

            let edges: Vec<(usize, Cost)> = graph
                .get_node(name)
                .map(|node| {
                    node.edges()
                        .filter_map(|e| index.get(e.to).map(|&v| (v, e.cost)))
                        .collect()
                })
                .unwrap_or_default();

            for (v, cost) in edges {
                let candidate = distance.saturating_add(cost);
                if completed[v] {
                    let settled = graph.get_node(&names[v]).and_then(|n| n.distance);
                    if settled.is_none_or(|d| candidate < d) {
                        return Err(RoutingError::InvariantViolation {
                            node: names[v].clone(),
                        });
                    }
                    continue;
                }
                if heap.decrease_key(v, candidate) {
                    if let Some(node) = graph.get_node_mut(&names[v]) {
                        node.distance = Some(candidate);
                        node.parent = Some(name.clone());
                    }
                }
            }
        }

        debug!(routes = table.len(), "route computation finished");
        Ok(table)
    }

    /// Resolve the next hop of a freshly completed node
    fn complete(
        graph: &mut TopologyGraph,
        source: &NodeAddr,
        name: &str,
        distance: Cost,
    ) -> RoutingResult<RouteEntry> {
        let violation = || RoutingError::InvariantViolation {
            node: name.to_string(),
        };
        let parent = graph
            .get_node(name)
            .and_then(|n| n.parent.clone())
            .ok_or_else(violation)?;
        let next_hop = if parent == source.name {
            name.to_string()
        } else {
            graph
                .get_node(&parent)
                .and_then(|p| p.next_hop.clone())
                .ok_or_else(violation)?
        };

        let next_hop_addr = graph
            .get_node(&next_hop)
            .map(|n| n.addr().clone())
            .ok_or_else(violation)?;
        let node = graph.get_node_mut(name).ok_or_else(violation)?;
        node.distance = Some(distance);
        node.next_hop = Some(next_hop);

        Ok(RouteEntry {
            destination: node.addr().clone(),
            next_hop: next_hop_addr,
            distance,
        })
    }
}
