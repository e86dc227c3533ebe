//! Ingress network topology discovery.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Smallest prefix length for which last-octet identifiers stay unique.
pub const OCTET_ID_MIN_PREFIX: u8 = 24;

/// The ingress subnet and this node's address on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressTopology {
    pub subnet: Ipv4Net,
    pub node_addr: Ipv4Addr,
}

impl IngressTopology {
    /// Whether the subnet is too large for last-octet identifiers.
    pub fn requires_indexed_ids(&self) -> bool {
        self.subnet.prefix_len() < OCTET_ID_MIN_PREFIX
    }
}

/// Discover the ingress topology. Any failure is fatal for the run.
pub async fn detect<P: Platform + ?Sized>(platform: &P) -> Result<IngressTopology> {
    let topology = platform.detect_topology().await.map_err(|e| match e {
        Error::TopologyUnavailable(_) => e,
        other => Error::TopologyUnavailable(other.to_string()),
    })?;

    if !topology.subnet.contains(&topology.node_addr) {
        return Err(Error::TopologyUnavailable(format!(
            "node address {} is outside ingress subnet {}",
            topology.node_addr, topology.subnet
        )));
    }

    info!(
        subnet = %topology.subnet,
        node_addr = %topology.node_addr,
        "Ingress topology detected"
    );
    Ok(topology)
}
