//! Load balancer registry and node identifier resolution.
//!
//! Each load balancer node gets a small integer identifier. The identifier is
//! written into the TOS byte of packets leaving the ingress namespace, copied
//! into the connection mark inside containers, and doubles as the number of
//! the per-node routing table. It therefore has to fit in 8 bits and must not
//! alias one of the kernel's own routing tables.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use tracing::info;

use crate::error::ConfigError;
use crate::topology::IngressTopology;

/// Kernel routing tables an identifier must never select (unspec, default, main, local).
const RESERVED_TABLES: [u8; 4] = [0, 253, 254, 255];

/// One entry of the configured load balancer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEntry {
    Active(Ipv4Addr),
    /// A node that no longer balances traffic but still holds its list position.
    Retired,
}

impl FromStr for GatewayEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "null" | "-" => Ok(GatewayEntry::Retired),
            other => other
                .parse()
                .map(GatewayEntry::Active)
                .map_err(|_| ConfigError::InvalidAddress(other.to_string())),
        }
    }
}

impl fmt::Display for GatewayEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEntry::Active(addr) => write!(f, "{addr}"),
            GatewayEntry::Retired => f.write_str("null"),
        }
    }
}

/// How identifiers are derived from the configured list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMode {
    /// Last octet of the node address.
    Octet,
    /// 1-based position in the configured list.
    Indexed,
}

impl fmt::Display for IdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdMode::Octet => f.write_str("octet"),
            IdMode::Indexed => f.write_str("indexed"),
        }
    }
}

/// Pick the identifier mode. Subnets larger than a /24 force indexed mode.
pub fn id_mode(topology: &IngressTopology, force_indexed: bool) -> IdMode {
    if force_indexed {
        return IdMode::Indexed;
    }
    if topology.requires_indexed_ids() {
        info!(
            subnet = %topology.subnet,
            "Ingress subnet larger than /24, forcing indexed identifiers"
        );
        return IdMode::Indexed;
    }
    IdMode::Octet
}

/// A configured load balancer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalancerNode {
    /// `None` for retired entries.
    pub addr: Option<Ipv4Addr>,
    /// `None` for retired entries.
    pub id: Option<u8>,
}

/// A non-retired node with its resolved identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActiveNode {
    pub id: u8,
    pub addr: Ipv4Addr,
}

impl ActiveNode {
    /// Routing table selected for traffic marked with this node's identifier.
    pub fn table(&self) -> u32 {
        u32::from(self.id)
    }
}

/// Resolved load balancer registry. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    mode: IdMode,
    nodes: Vec<LoadBalancerNode>,
}

impl Registry {
    /// Resolve identifiers for every entry.
    ///
    /// Fails on unrepresentable or reserved identifiers and on identifiers
    /// shared by two non-retired entries.
    pub fn resolve(entries: &[GatewayEntry], mode: IdMode) -> Result<Self, ConfigError> {
        let mut nodes = Vec::with_capacity(entries.len());
        let mut seen: HashMap<u8, Ipv4Addr> = HashMap::new();

        for (index, entry) in entries.iter().enumerate() {
            let position = index + 1;
            let addr = match entry {
                GatewayEntry::Active(addr) => *addr,
                GatewayEntry::Retired => {
                    nodes.push(LoadBalancerNode {
                        addr: None,
                        id: None,
                    });
                    continue;
                }
            };

            if seen.values().any(|a| *a == addr) {
                return Err(ConfigError::DuplicateAddress(addr));
            }

            let raw = match mode {
                IdMode::Indexed => position,
                IdMode::Octet => usize::from(addr.octets()[3]),
            };
            let id = u8::try_from(raw)
                .ok()
                .filter(|id| *id != 0)
                .ok_or(ConfigError::IdOutOfRange { addr, id: raw })?;
            if RESERVED_TABLES.contains(&id) {
                return Err(ConfigError::ReservedTable { addr, id });
            }
            if let Some(first) = seen.insert(id, addr) {
                return Err(ConfigError::DuplicateId {
                    id,
                    first,
                    second: addr,
                });
            }

            nodes.push(LoadBalancerNode {
                addr: Some(addr),
                id: Some(id),
            });
        }

        Ok(Self { mode, nodes })
    }

    pub fn mode(&self) -> IdMode {
        self.mode
    }

    pub fn nodes(&self) -> &[LoadBalancerNode] {
        &self.nodes
    }

    /// Non-retired nodes in list order.
    pub fn active(&self) -> Vec<ActiveNode> {
        self.nodes
            .iter()
            .filter_map(|n| Some(ActiveNode { id: n.id?, addr: n.addr? }))
            .collect()
    }

    /// Identifier of the node with the given address, if it is a load balancer.
    pub fn id_of(&self, addr: Ipv4Addr) -> Option<u8> {
        self.nodes
            .iter()
            .find(|n| n.addr == Some(addr))
            .and_then(|n| n.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);
    const C: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 4);

    fn entries(list: &str) -> Vec<GatewayEntry> {
        list.split(',').map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_parse_gateway_entries() {
        assert_eq!("10.0.0.2".parse::<GatewayEntry>(), Ok(GatewayEntry::Active(A)));
        assert_eq!("null".parse::<GatewayEntry>(), Ok(GatewayEntry::Retired));
        assert_eq!("-".parse::<GatewayEntry>(), Ok(GatewayEntry::Retired));
        assert_eq!(
            "10.0.0".parse::<GatewayEntry>(),
            Err(ConfigError::InvalidAddress("10.0.0".to_string()))
        );
    }

    #[test]
    fn test_octet_ids() {
        let registry = Registry::resolve(&[A, B, C].map(GatewayEntry::Active), IdMode::Octet)
            .expect("valid registry");
        let ids: Vec<u8> = registry.active().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_indexed_ids_keep_positions_of_retired_entries() {
        let registry =
            Registry::resolve(&entries("10.0.0.2,null,10.0.0.4"), IdMode::Indexed).unwrap();

        let ids: Vec<Option<u8>> = registry.nodes().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![Some(1), None, Some(3)]);
        assert_eq!(
            registry.active(),
            vec![ActiveNode { id: 1, addr: A }, ActiveNode { id: 3, addr: C }]
        );
    }

    #[test]
    fn test_id_of() {
        let registry = Registry::resolve(&entries("10.0.0.2,10.0.0.3"), IdMode::Indexed).unwrap();
        assert_eq!(registry.id_of(B), Some(2));
        assert_eq!(registry.id_of(Ipv4Addr::new(10, 0, 0, 99)), None);
    }

    #[test]
    fn test_octet_collision_fails() {
        let err = Registry::resolve(&entries("10.0.0.2,10.0.1.2"), IdMode::Octet).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateId {
                id: 2,
                first: A,
                second: Ipv4Addr::new(10, 0, 1, 2),
            }
        );
    }

    #[test]
    fn test_retired_entries_do_not_collide() {
        let registry = Registry::resolve(&entries("null,10.0.0.2,null"), IdMode::Octet).unwrap();
        assert_eq!(registry.active(), vec![ActiveNode { id: 2, addr: A }]);
    }

    #[test]
    fn test_reserved_tables_rejected() {
        let err = Registry::resolve(&entries("10.0.0.254"), IdMode::Octet).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedTable { id: 254, .. }));

        let err = Registry::resolve(&entries("10.0.0.0"), IdMode::Octet).unwrap_err();
        assert!(matches!(err, ConfigError::IdOutOfRange { id: 0, .. }));
    }

    #[test]
    fn test_indexed_out_of_range() {
        let mut list = vec![GatewayEntry::Retired; 255];
        list.push(GatewayEntry::Active(A));
        let err = Registry::resolve(&list, IdMode::Indexed).unwrap_err();
        assert_eq!(err, ConfigError::IdOutOfRange { addr: A, id: 256 });
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let err = Registry::resolve(&entries("10.0.0.2,10.0.0.2"), IdMode::Indexed).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateAddress(A));
    }

    #[test]
    fn test_large_subnet_forces_indexed_mode() {
        let topology = IngressTopology {
            subnet: "10.0.0.0/20".parse().unwrap(),
            node_addr: A,
        };
        assert_eq!(id_mode(&topology, false), IdMode::Indexed);

        let topology = IngressTopology {
            subnet: "10.0.0.0/24".parse().unwrap(),
            node_addr: A,
        };
        assert_eq!(id_mode(&topology, false), IdMode::Octet);
        assert_eq!(id_mode(&topology, true), IdMode::Indexed);
    }
}
