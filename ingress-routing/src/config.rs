//! Runtime configuration, built once from the command line.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::registry::GatewayEntry;

/// Container label carrying the swarm service name.
pub const SERVICE_LABEL: &str = "com.docker.swarm.service.name";

/// What the daemon was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Install,
    Uninstall,
}

/// Transport protocol a port filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic a marking rule set covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficScope {
    /// Every packet, regardless of protocol or port.
    All,
    /// Only `protocol` traffic to one of `ports`.
    Ports { protocol: Protocol, ports: Vec<u16> },
}

impl TrafficScope {
    /// iptables match arguments for this scope.
    pub fn match_args(&self) -> Vec<String> {
        match self {
            TrafficScope::All => Vec::new(),
            TrafficScope::Ports { protocol, ports } => {
                let ports = ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                vec![
                    "-p".to_string(),
                    protocol.as_str().to_string(),
                    "-m".to_string(),
                    "multiport".to_string(),
                    "--dports".to_string(),
                    ports,
                ]
            }
        }
    }
}

impl fmt::Display for TrafficScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficScope::All => f.write_str("all traffic"),
            TrafficScope::Ports { protocol, ports } => write!(f, "{protocol} ports {ports:?}"),
        }
    }
}

/// Allow-list of swarm service names. Empty matches every container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    names: BTreeSet<String>,
}

impl ServiceFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .filter(|n: &String| !n.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether a container with the given service label passes the filter.
    pub fn matches(&self, service: Option<&str>) -> bool {
        if self.names.is_empty() {
            return true;
        }
        service.is_some_and(|s| self.names.contains(s))
    }
}

/// Options for the ingress namespace marking pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkingOptions {
    pub scopes: Vec<TrafficScope>,
    /// Apply IPVS sysctl tuning and skip connection tracking for inbound traffic.
    pub performance: bool,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub services: ServiceFilter,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    pub gateways: Vec<GatewayEntry>,
    pub performance: bool,
    pub indexed_ids: bool,
    pub preexisting: bool,
    pub iptables_wait: bool,
    pub ingress_network: String,
    pub docker: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Install,
            services: ServiceFilter::default(),
            tcp_ports: Vec::new(),
            udp_ports: Vec::new(),
            gateways: Vec::new(),
            performance: true,
            indexed_ids: false,
            preexisting: false,
            iptables_wait: false,
            ingress_network: "ingress".to_string(),
            docker: PathBuf::from("docker"),
        }
    }
}

impl Config {
    /// Rule set partitions. TCP and UDP filters are independent; with neither
    /// configured a single unfiltered set covers everything.
    pub fn traffic_scopes(&self) -> Vec<TrafficScope> {
        let mut scopes = Vec::new();
        for (protocol, ports) in [
            (Protocol::Tcp, &self.tcp_ports),
            (Protocol::Udp, &self.udp_ports),
        ] {
            if !ports.is_empty() {
                let mut ports = ports.clone();
                ports.sort_unstable();
                ports.dedup();
                scopes.push(TrafficScope::Ports { protocol, ports });
            }
        }
        if scopes.is_empty() {
            scopes.push(TrafficScope::All);
        }
        scopes
    }

    pub fn marking_options(&self) -> MarkingOptions {
        MarkingOptions {
            scopes: self.traffic_scopes(),
            performance: self.performance,
        }
    }
}
