//! Configuration for the overlay node
//!
//! A node is configured from three plain-text files:
//!
//! - the main config, `key=value` per line (`updateInterval`, `weightFile`,
//!   `nodes`, `maxPacketSize`, `pingTimeout`)
//! - the weights file, one link per line: `hostA,ipA,hostB,ipB,cost`
//! - the ports file (`nodes`), one `hostname=port` per line
//!
//! Blank lines and lines starting with `#` are ignored in all three.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lsnet_core::{Cost, NodeAddr};
use lsnet_transport::ConnectionConfig;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// One undirected link from the weights file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub a: NodeAddr,
    pub b: NodeAddr,
    pub cost: Cost,
}

impl Link {
    /// The far end of this link as seen from `hostname`
    pub fn peer_of(&self, hostname: &str) -> Option<&NodeAddr> {
        if self.a.name == hostname && self.b.name != hostname {
            Some(&self.b)
        } else if self.b.name == hostname && self.a.name != hostname {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Static view of the overlay: who exists, where they listen, how they link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticTopology {
    addresses: BTreeMap<String, NodeAddr>,
    ports: BTreeMap<String, u16>,
    links: Vec<Link>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parsed weights and ports, checking that they agree
    pub fn from_parts(links: Vec<Link>, ports: BTreeMap<String, u16>) -> Result<Self, ConfigError> {
        let mut topology = Self {
            ports,
            ..Self::default()
        };
        for link in links {
            topology.register(&link.a)?;
            topology.register(&link.b)?;
            topology.links.push(link);
        }
        if let Some(name) = topology
            .addresses
            .keys()
            .find(|name| !topology.ports.contains_key(*name))
        {
            return Err(ConfigError::MissingPort(name.clone()));
        }
        Ok(topology)
    }

    fn register(&mut self, addr: &NodeAddr) -> Result<(), ConfigError> {
        match self.addresses.get(&addr.name) {
            Some(known) if known.ip != addr.ip => Err(ConfigError::ConflictingAddress {
                name: addr.name.clone(),
                first: known.ip.to_string(),
                second: addr.ip.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.addresses.insert(addr.name.clone(), addr.clone());
                Ok(())
            }
        }
    }

    /// Add a link, registering both ends
    pub fn with_link(mut self, a: NodeAddr, b: NodeAddr, cost: Cost) -> Self {
        self.addresses.entry(a.name.clone()).or_insert_with(|| a.clone());
        self.addresses.entry(b.name.clone()).or_insert_with(|| b.clone());
        self.links.push(Link { a, b, cost });
        self
    }

    /// Set the listening port of `hostname`
    pub fn with_port(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.ports.insert(hostname.into(), port);
        self
    }

    /// Neighbor costs of `hostname`; a repeated link keeps its last cost
    pub fn local_links(&self, hostname: &str) -> BTreeMap<NodeAddr, Cost> {
        self.links
            .iter()
            .filter_map(|link| link.peer_of(hostname).map(|peer| (peer.clone(), link.cost)))
            .collect()
    }

    /// Listening port of `hostname`
    pub fn port_of(&self, hostname: &str) -> Option<u16> {
        self.ports.get(hostname).copied()
    }

    /// Address of `hostname`
    pub fn address_of(&self, hostname: &str) -> Option<&NodeAddr> {
        self.addresses.get(hostname)
    }

    pub fn ports(&self) -> &BTreeMap<String, u16> {
        &self.ports
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }
}

/// Configuration for an [`OverlayNode`](crate::OverlayNode)
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's hostname and ip
    pub local: NodeAddr,
    /// Port the accept loop listens on
    pub listen_port: u16,
    /// How often the weights file is re-checked for local link changes
    pub update_interval: Duration,
    /// How often the local links are flooded even when unchanged
    pub reannounce_interval: Duration,
    /// Largest serialized payload sent without fragmenting
    pub max_packet_size: usize,
    /// How long a ping waits for its reply
    pub ping_timeout: Duration,
    /// Addresses, ports and links known at startup
    pub topology: StaticTopology,
    /// Weights file re-read on every force update
    pub weight_file: Option<PathBuf>,
    /// Logical clock resolution
    pub clock_tick: Duration,
    /// Retry policy for packets with no route
    pub no_route_retry: RetryPolicy,
    /// Retry policy for forwarding to an unreachable next hop
    pub connection_retry: RetryPolicy,
    /// Retry policy for flooding to an unreachable neighbor
    pub flood_retry: RetryPolicy,
    /// Timeouts and framing limits for peer connections
    pub connection: ConnectionConfig,
    /// How long an incomplete reassembly is kept
    pub reassembly_timeout: Duration,
    /// Delivery broadcast channel capacity
    pub delivery_channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(
            NodeAddr::new("localhost", IpAddr::V4(Ipv4Addr::LOCALHOST)),
            7000,
        )
    }
}

impl NodeConfig {
    /// Defaults for a node listening on `listen_port`
    pub fn new(local: NodeAddr, listen_port: u16) -> Self {
        Self {
            local,
            listen_port,
            update_interval: Duration::from_secs(10),
            reannounce_interval: Duration::from_secs(60),
            max_packet_size: 1024,
            ping_timeout: Duration::from_secs(5),
            topology: StaticTopology::new(),
            weight_file: None,
            clock_tick: Duration::from_millis(1),
            no_route_retry: RetryPolicy::no_route(),
            connection_retry: RetryPolicy::connection_failure(),
            flood_retry: RetryPolicy::flooding(),
            connection: ConnectionConfig::default(),
            reassembly_timeout: Duration::from_secs(30),
            delivery_channel_capacity: 1024,
        }
    }

    /// Load from a main config file for `hostname`
    pub fn load(config_path: impl AsRef<Path>, hostname: &str) -> Result<Self, ConfigError> {
        let config_path = config_path.as_ref();
        let main = MainConfig::parse(config_path, &read(config_path)?)?;

        let links = parse_weights(&main.weight_file, &read(&main.weight_file)?)?;
        let ports = parse_ports(&main.nodes_file, &read(&main.nodes_file)?)?;
        let topology = StaticTopology::from_parts(links, ports)?;

        let local = topology
            .address_of(hostname)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownHost(hostname.to_string()))?;
        let listen_port = topology
            .port_of(hostname)
            .ok_or_else(|| ConfigError::MissingPort(hostname.to_string()))?;
        debug!(
            hostname,
            port = listen_port,
            neighbors = topology.local_links(hostname).len(),
            "configuration loaded"
        );

        Ok(Self::new(local, listen_port)
            .with_update_interval(main.update_interval)
            .with_max_packet_size(main.max_packet_size)
            .with_ping_timeout(main.ping_timeout)
            .with_topology(topology)
            .with_weight_file(main.weight_file))
    }

    /// Current neighbor costs of this node
    pub fn local_links(&self) -> BTreeMap<NodeAddr, Cost> {
        self.topology.local_links(&self.local.name)
    }

    /// Set the local link check period
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Set the unconditional re-announcement period
    pub fn with_reannounce_interval(mut self, interval: Duration) -> Self {
        self.reannounce_interval = interval;
        self
    }

    /// Set the fragmentation threshold
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the ping timeout
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the static topology
    pub fn with_topology(mut self, topology: StaticTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the weights file re-read on force update
    pub fn with_weight_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.weight_file = Some(path.into());
        self
    }

    /// Set the logical clock resolution
    pub fn with_clock_tick(mut self, tick: Duration) -> Self {
        self.clock_tick = tick;
        self
    }

    /// Set the no-route retry policy
    pub fn with_no_route_retry(mut self, policy: RetryPolicy) -> Self {
        self.no_route_retry = policy;
        self
    }

    /// Set the forwarding connection retry policy
    pub fn with_connection_retry(mut self, policy: RetryPolicy) -> Self {
        self.connection_retry = policy;
        self
    }

    /// Set the flooding retry policy
    pub fn with_flood_retry(mut self, policy: RetryPolicy) -> Self {
        self.flood_retry = policy;
        self
    }

    /// Set the peer connection configuration
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set how long incomplete reassemblies are kept
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Set the delivery channel capacity
    pub fn with_delivery_channel_capacity(mut self, capacity: usize) -> Self {
        self.delivery_channel_capacity = capacity;
        self
    }
}

/// Re-read the weights file and return the neighbor costs of `hostname`
pub async fn reload_local_links(
    weight_file: &Path,
    hostname: &str,
) -> Result<BTreeMap<NodeAddr, Cost>, ConfigError> {
    let text = tokio::fs::read_to_string(weight_file)
        .await
        .map_err(|source| ConfigError::Read {
            path: weight_file.to_path_buf(),
            source,
        })?;
    let links = parse_weights(weight_file, &text)?;
    if !links.iter().any(|l| l.a.name == hostname || l.b.name == hostname) {
        return Err(ConfigError::UnknownHost(hostname.to_string()));
    }
    Ok(links
        .iter()
        .filter_map(|link| link.peer_of(hostname).map(|peer| (peer.clone(), link.cost)))
        .collect())
}

/// Settings from the main config file
#[derive(Debug, Clone, PartialEq)]
struct MainConfig {
    update_interval: Duration,
    weight_file: PathBuf,
    nodes_file: PathBuf,
    max_packet_size: usize,
    ping_timeout: Duration,
}

impl MainConfig {
    fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let defaults = NodeConfig::default();
        let mut update_interval = defaults.update_interval;
        let mut max_packet_size = defaults.max_packet_size;
        let mut ping_timeout = defaults.ping_timeout;
        let mut weight_file = None;
        let mut nodes_file = None;

        for (line_no, line) in content_lines(text) {
            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| ConfigError::parse(path, line_no, "expected key=value"))?;
            match key {
                "updateInterval" => update_interval = parse_seconds(path, line_no, value)?,
                "pingTimeout" => ping_timeout = parse_seconds(path, line_no, value)?,
                "maxPacketSize" => {
                    max_packet_size = value
                        .parse::<usize>()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| {
                            ConfigError::parse(path, line_no, format!("invalid maxPacketSize `{value}`"))
                        })?
                }
                "weightFile" => weight_file = Some(base.join(value)),
                "nodes" => nodes_file = Some(base.join(value)),
                other => warn!(path = %path.display(), line = line_no, key = other, "unknown config key ignored"),
            }
        }

        Ok(Self {
            update_interval,
            weight_file: weight_file.ok_or(ConfigError::MissingKey("weightFile"))?,
            nodes_file: nodes_file.ok_or(ConfigError::MissingKey("nodes"))?,
            max_packet_size,
            ping_timeout,
        })
    }
}

/// Parse a weights file
pub fn parse_weights(path: &Path, text: &str) -> Result<Vec<Link>, ConfigError> {
    content_lines(text)
        .map(|(line_no, line)| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [host_a, ip_a, host_b, ip_b, cost] = fields.as_slice() else {
                return Err(ConfigError::parse(
                    path,
                    line_no,
                    format!("expected hostA,ipA,hostB,ipB,cost, got {} fields", fields.len()),
                ));
            };
            let addr = |host: &str, ip: &str| {
                NodeAddr::parse(host, ip).map_err(|e| ConfigError::parse(path, line_no, e.to_string()))
            };
            let cost = cost
                .parse::<Cost>()
                .map_err(|_| ConfigError::parse(path, line_no, format!("invalid cost `{cost}`")))?;
            Ok(Link {
                a: addr(*host_a, *ip_a)?,
                b: addr(*host_b, *ip_b)?,
                cost,
            })
        })
        .collect()
}

/// Parse a ports file
pub fn parse_ports(path: &Path, text: &str) -> Result<BTreeMap<String, u16>, ConfigError> {
    let mut ports = BTreeMap::new();
    let mut owners: BTreeMap<u16, String> = BTreeMap::new();
    for (line_no, line) in content_lines(text) {
        let (host, port) = line
            .split_once('=')
            .map(|(h, p)| (h.trim(), p.trim()))
            .ok_or_else(|| ConfigError::parse(path, line_no, "expected hostname=port"))?;
        if host.is_empty() {
            return Err(ConfigError::parse(path, line_no, "empty hostname"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::parse(path, line_no, format!("invalid port `{port}`")))?;
        if let Some(first) = owners.get(&port) {
            return Err(ConfigError::DuplicatePort {
                port,
                first: first.clone(),
                second: host.to_string(),
            });
        }
        if ports.insert(host.to_string(), port).is_some() {
            return Err(ConfigError::parse(path, line_no, format!("{host} listed twice")));
        }
        owners.insert(port, host.to_string());
    }
    Ok(ports)
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_seconds(path: &Path, line: usize, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ConfigError::parse(path, line, format!("invalid duration `{value}`")))
}

/// Non-blank, non-comment lines with 1-based line numbers
fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const WEIGHTS: &str = "\
# hostA,ipA,hostB,ipB,cost
n1,127.0.0.1,n2,127.0.0.1,1
n2,127.0.0.1,n3,127.0.0.1,2
";
    const PORTS: &str = "n1=7001\nn2=7002\nn3=7003\n";

    fn write_config(dir: &TempDir, main: &str, weights: &str, ports: &str) -> PathBuf {
        fs::write(dir.path().join("weights.csv"), weights).unwrap();
        fs::write(dir.path().join("nodes.txt"), ports).unwrap();
        let config = dir.path().join("config");
        fs::write(&config, main).unwrap();
        config
    }

    const MAIN: &str = "\
updateInterval=2
weightFile=weights.csv
nodes=nodes.txt
maxPacketSize=256
pingTimeout=1.5
";

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MAIN, WEIGHTS, PORTS);
        let config = NodeConfig::load(&path, "n2").unwrap();

        assert_eq!(config.local.name, "n2");
        assert_eq!(config.listen_port, 7002);
        assert_eq!(config.update_interval, Duration::from_secs(2));
        assert_eq!(config.max_packet_size, 256);
        assert_eq!(config.ping_timeout, Duration::from_millis(1500));
        assert_eq!(config.weight_file.as_deref(), Some(dir.path().join("weights.csv").as_path()));

        let links = config.local_links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[config.topology.address_of("n1").unwrap()], 1);
        assert_eq!(links[config.topology.address_of("n3").unwrap()], 2);
        assert_eq!(config.topology.port_of("n3"), Some(7003));
    }

    #[test]
    fn test_optional_keys_default() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "weightFile=weights.csv\nnodes=nodes.txt\nflavour=mint\n", WEIGHTS, PORTS);
        let config = NodeConfig::load(&path, "n1").unwrap();
        assert_eq!(config.max_packet_size, 1024);
        assert_eq!(config.update_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_required_key() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "nodes=nodes.txt\n", WEIGHTS, PORTS);
        assert!(matches!(
            NodeConfig::load(&path, "n1"),
            Err(ConfigError::MissingKey("weightFile"))
        ));
    }

    #[test]
    fn test_missing_port() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MAIN, WEIGHTS, "n1=7001\nn2=7002\n");
        assert!(matches!(
            NodeConfig::load(&path, "n1"),
            Err(ConfigError::MissingPort(ref host)) if host == "n3"
        ));
    }

    #[test]
    fn test_duplicate_port() {
        let err = parse_ports(Path::new("nodes.txt"), "n1=7001\nn2=7001\n").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePort { port: 7001, .. }));
    }

    #[test]
    fn test_unknown_host() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MAIN, WEIGHTS, PORTS);
        assert!(matches!(
            NodeConfig::load(&path, "n9"),
            Err(ConfigError::UnknownHost(ref host)) if host == "n9"
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "weightFile=nope.csv\nnodes=nodes.txt\n", WEIGHTS, PORTS);
        assert!(matches!(NodeConfig::load(&path, "n1"), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_weights_parse_errors_carry_line() {
        let path = Path::new("weights.csv");
        let err = parse_weights(path, "n1,127.0.0.1,n2,127.0.0.1,1\n\nn1,127.0.0.1,n2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 3, .. }));

        let err = parse_weights(path, "n1,not-an-ip,n2,127.0.0.1,1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));

        let err = parse_weights(path, "n1,127.0.0.1,n2,127.0.0.1,-4\n").unwrap_err();
        assert!(err.to_string().contains("invalid cost"));
    }

    #[test]
    fn test_bad_values_in_main_config() {
        let path = Path::new("config");
        for text in ["updateInterval=soon", "maxPacketSize=0", "pingTimeout=-1", "justakey"] {
            assert!(
                matches!(MainConfig::parse(path, text), Err(ConfigError::Parse { line: 1, .. })),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn test_conflicting_address() {
        let links = parse_weights(
            Path::new("w"),
            "n1,10.0.0.1,n2,10.0.0.2,1\nn2,10.0.0.9,n3,10.0.0.3,1\n",
        )
        .unwrap();
        let ports = parse_ports(Path::new("p"), "n1=1\nn2=2\nn3=3\n").unwrap();
        assert!(matches!(
            StaticTopology::from_parts(links, ports),
            Err(ConfigError::ConflictingAddress { ref name, .. }) if name == "n2"
        ));
    }

    #[test]
    fn test_self_links_ignored() {
        let topology = StaticTopology::new()
            .with_link(NodeAddr::parse("n1", "10.0.0.1").unwrap(), NodeAddr::parse("n1", "10.0.0.1").unwrap(), 3)
            .with_link(NodeAddr::parse("n1", "10.0.0.1").unwrap(), NodeAddr::parse("n2", "10.0.0.2").unwrap(), 4);
        let links = topology.local_links("n1");
        assert_eq!(links.len(), 1);
        assert_eq!(links.values().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[tokio::test]
    async fn test_reload_local_links() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.csv");
        fs::write(&path, WEIGHTS).unwrap();
        assert_eq!(reload_local_links(&path, "n3").await.unwrap().len(), 1);

        fs::write(&path, "n1,127.0.0.1,n3,127.0.0.1,5\nn2,127.0.0.1,n3,127.0.0.1,2\n").unwrap();
        let links = reload_local_links(&path, "n3").await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.values().any(|c| *c == 5));

        assert!(matches!(
            reload_local_links(&path, "n7").await,
            Err(ConfigError::UnknownHost(_))
        ));
    }
}
