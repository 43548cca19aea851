//! Routing tables
//!
//! A [`RoutingTable`] is produced wholesale by the route computation and is
//! never mutated afterwards. [`SharedRoutingTable`] publishes the current
//! table behind an `Arc` so that forwarding workers can take a consistent
//! snapshot with one short read lock, independent of any computation in
//! progress.

use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lsnet_core::{Cost, NodeAddr};
use parking_lot::RwLock;

/// Route to a single destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Final destination
    pub destination: NodeAddr,
    /// Neighbor to forward through
    pub next_hop: NodeAddr,
    /// Total path cost
    pub distance: Cost,
}

/// Shortest-path routes from one source
///
/// Always contains the self-entry (distance 0, next hop = source).
/// Unreachable nodes have no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    source: NodeAddr,
    entries: BTreeMap<String, RouteEntry>,
}

impl RoutingTable {
    /// A table holding only the self-entry
    pub fn new(source: NodeAddr) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            source.name.clone(),
            RouteEntry {
                destination: source.clone(),
                next_hop: source.clone(),
                distance: 0,
            },
        );
        Self { source, entries }
    }

    pub(crate) fn insert(&mut self, entry: RouteEntry) {
        self.entries.insert(entry.destination.name.clone(), entry);
    }

    /// The node these routes start from
    pub fn source(&self) -> &NodeAddr {
        &self.source
    }

    /// Route to `destination`, if reachable
    pub fn get(&self, destination: &str) -> Option<&RouteEntry> {
        self.entries.get(destination)
    }

    /// Next hop toward `destination`, if reachable
    pub fn next_hop(&self, destination: &str) -> Option<&NodeAddr> {
        self.entries.get(destination).map(|e| &e.next_hop)
    }

    /// Whether `destination` is reachable
    pub fn contains(&self, destination: &str) -> bool {
        self.entries.contains_key(destination)
    }

    /// Entries ordered by destination hostname
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    /// Number of entries, including the self-entry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always `false`; the self-entry is never removed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as CSV with a `source,destination,next_hop,distance` header
    pub fn to_csv(&self) -> String {
        let mut out = String::from("source,destination,next_hop,distance\n");
        for entry in self.entries.values() {
            // Writing into a String cannot fail
            let _ = writeln!(
                out,
                "{},{},{},{}",
                self.source.name, entry.destination.name, entry.next_hop.name, entry.distance
            );
        }
        out
    }
}

impl Display for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Routing table for: {}", self.source.name)?;
        for entry in self.entries.values() {
            writeln!(
                f,
                "destination: {} => next hop: {} distance: {}",
                entry.destination.name, entry.next_hop.name, entry.distance
            )?;
        }
        Ok(())
    }
}

/// The currently published routing table
#[derive(Debug)]
pub struct SharedRoutingTable {
    current: RwLock<Arc<RoutingTable>>,
    recomputing: AtomicBool,
}

impl SharedRoutingTable {
    /// Start with a table holding only the self-entry
    pub fn new(source: NodeAddr) -> Self {
        Self {
            current: RwLock::new(Arc::new(RoutingTable::new(source))),
            recomputing: AtomicBool::new(false),
        }
    }

    /// Copy out the current table
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.current.read())
    }

    /// Replace the current table
    pub fn publish(&self, table: RoutingTable) {
        *self.current.write() = Arc::new(table);
    }

    /// Whether a route computation is running
    pub fn is_recomputing(&self) -> bool {
        self.recomputing.load(Ordering::Acquire)
    }

    /// Flag a computation as running until the guard is dropped
    pub fn mark_computing(&self) -> ComputingGuard<'_> {
        self.recomputing.store(true, Ordering::Release);
        ComputingGuard { flag: &self.recomputing }
    }
}

/// Clears the recomputing flag on drop
#[derive(Debug)]
pub struct ComputingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u8) -> NodeAddr {
        NodeAddr::parse(&format!("n{i}"), &format!("10.0.0.{i}")).unwrap()
    }

    fn sample() -> RoutingTable {
        let mut table = RoutingTable::new(n(1));
        table.insert(RouteEntry {
            destination: n(3),
            next_hop: n(2),
            distance: 2,
        });
        table.insert(RouteEntry {
            destination: n(2),
            next_hop: n(2),
            distance: 1,
        });
        table
    }

    #[test]
    fn test_self_entry() {
        let table = RoutingTable::new(n(1));
        let entry = table.get("n1").unwrap();
        assert_eq!(entry.distance, 0);
        assert_eq!(entry.next_hop, n(1));
        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_lookup() {
        let table = sample();
        assert_eq!(table.next_hop("n3"), Some(&n(2)));
        assert!(table.get("n9").is_none());
        assert!(table.contains("n2"));
    }

    #[test]
    fn test_csv_ordered_by_destination() {
        let csv = sample().to_csv();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "source,destination,next_hop,distance",
                "n1,n1,n1,0",
                "n1,n2,n2,1",
                "n1,n3,n2,2",
            ]
        );
    }

    #[test]
    fn test_display() {
        let text = sample().to_string();
        assert!(text.starts_with("Routing table for: n1\n"));
        assert!(text.contains("destination: n3 => next hop: n2 distance: 2"));
    }

    #[test]
    fn test_shared_publish_and_snapshot() {
        let shared = SharedRoutingTable::new(n(1));
        let before = shared.snapshot();
        assert_eq!(before.len(), 1);

        shared.publish(sample());
        // Old snapshots are unaffected
        assert_eq!(before.len(), 1);
        assert_eq!(shared.snapshot().len(), 3);
    }

    #[test]
    fn test_computing_guard() {
        let shared = SharedRoutingTable::new(n(1));
        assert!(!shared.is_recomputing());
        {
            let _guard = shared.mark_computing();
            assert!(shared.is_recomputing());
        }
        assert!(!shared.is_recomputing());
    }
}
