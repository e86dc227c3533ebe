//! Per-container return-path routing.
//!
//! Inside a container's namespace, packets arriving from load balancer node K
//! carry K in their TOS byte. That value is copied into the connection mark,
//! restored onto every reply, and a policy rule per node sends marked replies
//! through a table whose default route points back at K.

use std::fmt;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::config::ServiceFilter;
use crate::error::Result;
use crate::firewall::{FirewallRule, Position, Table};
use crate::platform::{ContainerStart, Namespace, Platform};
use crate::registry::{ActiveNode, Registry};
use crate::routing::{Route, RoutingRule};
use crate::topology::IngressTopology;

/// Comment carried by the marker rule of a configured container.
pub const MARKER_COMMENT: &str = "ingress-routing-daemon";

/// Policy rule priority. Below `main` (32766), so normal lookups are never shadowed.
pub const RULE_PRIORITY: u32 = 32700;

/// Reverse-path filter modes.
const RP_FILTER_STRICT: &str = "1";
const RP_FILTER_LOOSE: &str = "2";

/// Result of a single install attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { iface: String },
    SkippedService,
    SkippedNoInterface,
    AlreadyConfigured,
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallOutcome::Installed { iface } => write!(f, "installed on {iface}"),
            InstallOutcome::SkippedService => f.write_str("service not selected"),
            InstallOutcome::SkippedNoInterface => f.write_str("no ingress interface"),
            InstallOutcome::AlreadyConfigured => f.write_str("already configured"),
        }
    }
}

/// A container's namespace together with what was found in it.
#[derive(Debug)]
pub struct ContainerBinding<N> {
    pub id: String,
    pub namespace: N,
    /// Interface on the ingress subnet. `None` if the container is not attached.
    pub iface: Option<String>,
    /// Whether the marker rule is already present.
    pub installed: bool,
}

impl<N: Namespace> ContainerBinding<N> {
    /// Inspect `namespace` for an ingress interface and an earlier install.
    pub async fn inspect(id: impl Into<String>, namespace: N, subnet: Ipv4Net) -> Result<Self> {
        let iface = namespace
            .interface_addrs()
            .await?
            .into_iter()
            .find(|a| subnet.contains(&a.addr.addr()))
            .map(|a| a.name);

        let installed = match iface {
            Some(_) => namespace
                .list_firewall_rules(Table::Mangle)
                .await?
                .iter()
                .any(is_marker),
            None => false,
        };

        Ok(Self {
            id: id.into(),
            namespace,
            iface,
            installed,
        })
    }
}

fn marker_rule() -> FirewallRule {
    FirewallRule::new(
        Table::Mangle,
        "PREROUTING",
        ["-m", "comment", "--comment", MARKER_COMMENT],
    )
}

fn is_marker(rule: &FirewallRule) -> bool {
    rule.chain == "PREROUTING" && rule.spec().contains(&format!("--comment {MARKER_COMMENT}"))
}

/// Everything installed into one container, in installation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRuleSet {
    /// TOS to connection mark copies, then mark restore for replies.
    pub firewall: Vec<FirewallRule>,
    /// `rp_filter` keys relaxed from strict to loose.
    pub rp_filter: Vec<String>,
    pub rules: Vec<RoutingRule>,
    pub routes: Vec<Route>,
    /// Added last, once everything else succeeded.
    pub marker: FirewallRule,
}

impl RoutingRuleSet {
    pub fn build(subnet: Ipv4Net, iface: &str, nodes: &[ActiveNode]) -> Self {
        let mut firewall: Vec<FirewallRule> = nodes
            .iter()
            .map(|node| {
                FirewallRule::new(
                    Table::Mangle,
                    "PREROUTING",
                    [
                        "-i".to_string(),
                        iface.to_string(),
                        "-m".to_string(),
                        "tos".to_string(),
                        "--tos".to_string(),
                        format!("{:#04x}/0xff", node.id),
                        "-j".to_string(),
                        "CONNMARK".to_string(),
                        "--set-xmark".to_string(),
                        format!("{:#x}/0xffffffff", node.id),
                    ],
                )
            })
            .collect();
        for protocol in ["tcp", "udp"] {
            firewall.push(FirewallRule::new(
                Table::Mangle,
                "OUTPUT",
                ["-p", protocol, "-j", "CONNMARK", "--restore-mark"],
            ));
        }

        let rp_filter = ["all", iface]
            .iter()
            .map(|scope| format!("net.ipv4.conf.{scope}.rp_filter"))
            .collect();

        let rules = nodes
            .iter()
            .map(|node| RoutingRule {
                priority: RULE_PRIORITY,
                from: subnet,
                fwmark: u32::from(node.id),
                table: node.table(),
            })
            .collect();

        let routes = nodes
            .iter()
            .map(|node| Route {
                table: node.table(),
                via: node.addr,
                dev: iface.to_string(),
            })
            .collect();

        Self {
            firewall,
            rp_filter,
            rules,
            routes,
            marker: marker_rule(),
        }
    }

    /// Apply the set. Every step tolerates being repeated.
    pub async fn apply<N: Namespace + ?Sized>(&self, ns: &N) -> Result<()> {
        for rule in &self.firewall {
            ns.add_firewall_rule(rule, Position::Append).await?;
        }
        for key in &self.rp_filter {
            // Disabled (0) or already loose filtering is left alone.
            if ns.get_sysctl(key).await? == RP_FILTER_STRICT {
                ns.set_sysctl(key, RP_FILTER_LOOSE).await?;
            }
        }

        let existing = ns.list_routing_rules().await?;
        for rule in &self.rules {
            if existing.contains(rule) {
                debug!(namespace = ns.label(), rule = %rule, "Routing rule already present");
                continue;
            }
            ns.add_routing_rule(rule).await?;
        }
        for route in &self.routes {
            ns.replace_route(route).await?;
        }

        ns.add_firewall_rule(&self.marker, Position::Append).await
    }
}

/// Configures return-path routing inside containers.
#[derive(Debug, Clone)]
pub struct ReturnPathInstaller {
    subnet: Ipv4Net,
    nodes: Vec<ActiveNode>,
    services: ServiceFilter,
}

impl ReturnPathInstaller {
    pub fn new(topology: &IngressTopology, registry: &Registry, services: ServiceFilter) -> Self {
        Self {
            subnet: topology.subnet,
            nodes: registry.active(),
            services,
        }
    }

    pub fn services(&self) -> &ServiceFilter {
        &self.services
    }

    /// Configure a started container, unless it is filtered out, detached
    /// from the ingress network or already configured.
    pub async fn install<P: Platform + ?Sized>(
        &self,
        platform: &P,
        container: &ContainerStart,
    ) -> Result<InstallOutcome> {
        if !self.services.matches(container.service.as_deref()) {
            debug!(
                container = %container.id,
                service = container.service.as_deref().unwrap_or("-"),
                "Skipping container outside selected services"
            );
            return Ok(InstallOutcome::SkippedService);
        }

        let namespace = platform.enter_container(&container.id).await?;
        let binding = ContainerBinding::inspect(&container.id, namespace, self.subnet).await?;
        self.configure(&binding).await
    }

    pub async fn configure<N: Namespace>(
        &self,
        binding: &ContainerBinding<N>,
    ) -> Result<InstallOutcome> {
        let Some(iface) = binding.iface.as_deref() else {
            debug!(container = %binding.id, "Container has no ingress interface");
            return Ok(InstallOutcome::SkippedNoInterface);
        };
        if binding.installed {
            info!(container = %binding.id, "Return path already configured");
            return Ok(InstallOutcome::AlreadyConfigured);
        }

        RoutingRuleSet::build(self.subnet, iface, &self.nodes)
            .apply(&binding.namespace)
            .await?;

        info!(
            container = %binding.id,
            iface,
            nodes = self.nodes.len(),
            "Return path configured"
        );
        Ok(InstallOutcome::Installed {
            iface: iface.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn nodes() -> Vec<ActiveNode> {
        vec![
            ActiveNode {
                id: 1,
                addr: Ipv4Addr::new(10, 0, 0, 2),
            },
            ActiveNode {
                id: 3,
                addr: Ipv4Addr::new(10, 0, 0, 4),
            },
        ]
    }

    #[test]
    fn test_rule_set_per_node() {
        let set = RoutingRuleSet::build("10.0.0.0/24".parse().unwrap(), "eth1", &nodes());

        assert_eq!(
            set.firewall[0].to_string(),
            "-t mangle -A PREROUTING -i eth1 -m tos --tos 0x01/0xff -j CONNMARK --set-xmark 0x1/0xffffffff"
        );
        assert_eq!(
            set.firewall[2].to_string(),
            "-t mangle -A OUTPUT -p tcp -j CONNMARK --restore-mark"
        );
        assert_eq!(set.firewall.len(), 4);

        assert_eq!(
            set.rules.iter().map(|r| (r.fwmark, r.table)).collect::<Vec<_>>(),
            vec![(1, 1), (3, 3)]
        );
        assert!(set.rules.iter().all(|r| r.priority == RULE_PRIORITY));
        assert_eq!(set.routes[1].via, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(set.routes[1].table, 3);

        assert_eq!(
            set.rp_filter,
            vec!["net.ipv4.conf.all.rp_filter", "net.ipv4.conf.eth1.rp_filter"]
        );
    }

    #[test]
    fn test_marker_detection() {
        assert!(is_marker(&marker_rule()));
        let other = FirewallRule::new(
            Table::Mangle,
            "PREROUTING",
            ["-m", "comment", "--comment", "something-else"],
        );
        assert!(!is_marker(&other));
    }
}
