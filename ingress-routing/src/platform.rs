//! Capability interface to the container platform and its network namespaces.
//!
//! The installers only ever talk to these traits. The docker backend lives in
//! [`crate::docker`]; tests use the in-memory platform from `test_util`.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::firewall::{FirewallRule, Position, Table};
use crate::routing::{InterfaceAddr, Route, RoutingRule};
use crate::topology::IngressTopology;

/// A started (or already running) container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStart {
    pub id: String,
    /// Swarm service name, if the container belongs to a service.
    pub service: Option<String>,
}

impl ContainerStart {
    pub fn new(id: impl Into<String>, service: Option<&str>) -> Self {
        Self {
            id: id.into(),
            service: service.map(str::to_string),
        }
    }
}

/// Live container start events.
pub type ContainerStream = BoxStream<'static, Result<ContainerStart>>;

/// Operations scoped to one network namespace.
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Human readable label for logs.
    fn label(&self) -> &str;

    async fn list_firewall_rules(&self, table: Table) -> Result<Vec<FirewallRule>>;

    /// Add a rule unless an identical one already exists.
    async fn add_firewall_rule(&self, rule: &FirewallRule, position: Position) -> Result<()>;

    async fn delete_firewall_rule(&self, rule: &FirewallRule) -> Result<()>;

    async fn list_routing_rules(&self) -> Result<Vec<RoutingRule>>;

    async fn add_routing_rule(&self, rule: &RoutingRule) -> Result<()>;

    /// Install a route, replacing any route for the same destination and table.
    async fn replace_route(&self, route: &Route) -> Result<()>;

    async fn interface_addrs(&self) -> Result<Vec<InterfaceAddr>>;

    async fn get_sysctl(&self, key: &str) -> Result<String>;

    async fn set_sysctl(&self, key: &str, value: &str) -> Result<()>;
}

/// The container platform.
#[async_trait]
pub trait Platform: Send + Sync {
    type Namespace: Namespace;

    /// Ingress subnet and this node's address on it.
    async fn detect_topology(&self) -> Result<IngressTopology>;

    /// Enter the ingress (load balancer) namespace.
    async fn enter_ingress(&self) -> Result<Self::Namespace>;

    /// Enter a container's network namespace.
    async fn enter_container(&self, id: &str) -> Result<Self::Namespace>;

    /// Snapshot of running containers.
    async fn running_containers(&self) -> Result<Vec<ContainerStart>>;

    /// Subscribe to container start events.
    async fn container_starts(&self) -> Result<ContainerStream>;

    /// Terminate every external process spawned on behalf of this platform.
    fn shutdown(&self);
}
