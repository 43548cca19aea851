//! Routing error types

use thiserror::Error;

/// Errors raised by the routing layer
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Destination is not present in the routing table
    #[error("No route to {0}")]
    NoRoute(String),

    /// Dijkstra attempted to relax a node that was already completed.
    ///
    /// Cannot happen with non-negative costs; seeing it means the route
    /// computation itself is broken.
    #[error("Route computation invariant violated: relaxed completed node {node}")]
    InvariantViolation { node: String },

    /// A hostname that is not part of the topology graph
    #[error("Unknown node: {0}")]
    UnknownNode(String),
}

impl RoutingError {
    /// Whether this error indicates a defect rather than a runtime condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, RoutingError::InvariantViolation { .. })
    }
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;
