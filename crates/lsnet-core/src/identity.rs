//! Node identity on the overlay
//!
//! A node is identified by its hostname; the ip travels with it so that
//! peers can open connections. Two addresses are equal only when both the
//! hostname and the ip match.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Link cost / path distance. Costs are never negative.
pub type Cost = u64;

/// A node's address on the overlay
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    /// Unique hostname of the node
    pub name: String,
    /// Address the node listens on
    pub ip: IpAddr,
}

impl NodeAddr {
    /// Create a new node address
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }

    /// Parse a hostname and textual ip
    pub fn parse(name: &str, ip: &str) -> Result<Self, IdentityError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::EmptyHostname);
        }
        let ip = ip
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| IdentityError::InvalidAddress(ip.trim().to_string()))?;
        Ok(Self::new(name, ip))
    }

    /// Socket address of this node for the given listening port
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip, port)
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A directly attached neighbor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborInfo {
    /// The neighbor's address
    pub addr: NodeAddr,
    /// The neighbor's listening port
    pub port: u16,
    /// Cost of the link to the neighbor
    pub cost: Cost,
}

impl NeighborInfo {
    /// Create neighbor info
    pub fn new(addr: NodeAddr, port: u16, cost: Cost) -> Self {
        Self { addr, port, cost }
    }

    /// Where to connect to reach this neighbor
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr.socket_addr(self.port)
    }
}
