//! In-memory platform for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Error, Result};
use crate::firewall::{FirewallRule, Position, Table};
use crate::platform::{ContainerStart, ContainerStream, Namespace, Platform};
use crate::routing::{InterfaceAddr, Route, RoutingRule};
use crate::topology::IngressTopology;

/// Kernel state of a fake namespace. Comparable, so tests can check that a
/// repeated operation left everything unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceState {
    /// Rules in chain order.
    pub firewall: Vec<FirewallRule>,
    pub routing_rules: Vec<RoutingRule>,
    pub routes: Vec<Route>,
    pub addrs: Vec<InterfaceAddr>,
    pub sysctls: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: NamespaceState,
    failures: HashMap<&'static str, usize>,
    calls: usize,
}

/// A network namespace backed by memory. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeNamespace {
    label: String,
    inner: Arc<Mutex<Inner>>,
}

impl FakeNamespace {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            inner: Arc::default(),
        }
    }

    /// Add an interface address, e.g. `with_addr("eth1", "10.0.0.7/24")`.
    pub fn with_addr(self, name: &str, cidr: &str) -> Self {
        self.lock().state.addrs.push(InterfaceAddr {
            name: name.to_string(),
            addr: cidr.parse().expect("valid cidr"),
        });
        self
    }

    pub fn with_sysctl(self, key: &str, value: &str) -> Self {
        self.lock()
            .state
            .sysctls
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_firewall_rule(self, rule: FirewallRule) -> Self {
        self.lock().state.firewall.push(rule);
        self
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail(&self, operation: &'static str, times: usize) {
        self.lock().failures.insert(operation, times);
    }

    pub fn snapshot(&self) -> NamespaceState {
        self.lock().state.clone()
    }

    pub fn firewall_rules(&self) -> Vec<FirewallRule> {
        self.lock().state.firewall.clone()
    }

    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        self.lock().state.routing_rules.clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.lock().state.routes.clone()
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock().state.sysctls.get(key).cloned()
    }

    /// Total number of namespace operations performed.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("namespace state poisoned")
    }

    fn begin(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls += 1;
        if let Some(remaining) = inner.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::CommandFailed {
                    command: format!("{} {operation}", self.label),
                    stderr: "injected failure".to_string(),
                });
            }
        }
        Ok(inner)
    }
}

#[async_trait]
impl Namespace for FakeNamespace {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list_firewall_rules(&self, table: Table) -> Result<Vec<FirewallRule>> {
        let inner = self.begin("list_firewall_rules")?;
        Ok(inner
            .state
            .firewall
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    async fn add_firewall_rule(&self, rule: &FirewallRule, position: Position) -> Result<()> {
        let mut inner = self.begin("add_firewall_rule")?;
        let rules = &mut inner.state.firewall;
        if rules.contains(rule) {
            return Ok(());
        }
        match position {
            Position::Append => rules.push(rule.clone()),
            Position::Insert => {
                let head = rules
                    .iter()
                    .position(|r| r.table == rule.table && r.chain == rule.chain)
                    .unwrap_or(rules.len());
                rules.insert(head, rule.clone());
            }
        }
        Ok(())
    }

    async fn delete_firewall_rule(&self, rule: &FirewallRule) -> Result<()> {
        let mut inner = self.begin("delete_firewall_rule")?;
        let rules = &mut inner.state.firewall;
        match rules.iter().position(|r| r == rule) {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(Error::CommandFailed {
                command: format!("iptables -D {rule}"),
                stderr: "Bad rule (does a matching rule exist in that chain?)".to_string(),
            }),
        }
    }

    async fn list_routing_rules(&self) -> Result<Vec<RoutingRule>> {
        let inner = self.begin("list_routing_rules")?;
        Ok(inner.state.routing_rules.clone())
    }

    async fn add_routing_rule(&self, rule: &RoutingRule) -> Result<()> {
        // Like `ip rule add`, duplicates are accepted.
        self.begin("add_routing_rule")?
            .state
            .routing_rules
            .push(*rule);
        Ok(())
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        let mut inner = self.begin("replace_route")?;
        let routes = &mut inner.state.routes;
        routes.retain(|r| r.table != route.table);
        routes.push(route.clone());
        Ok(())
    }

    async fn interface_addrs(&self) -> Result<Vec<InterfaceAddr>> {
        let inner = self.begin("interface_addrs")?;
        Ok(inner.state.addrs.clone())
    }

    async fn get_sysctl(&self, key: &str) -> Result<String> {
        let inner = self.begin("get_sysctl")?;
        inner.state.sysctls.get(key).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no sysctl {key}"),
            ))
        })
    }

    async fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
        self.begin("set_sysctl")?
            .state
            .sysctls
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A platform whose namespaces and events are scripted by the test.
#[derive(Debug)]
pub struct FakePlatform {
    topology: IngressTopology,
    ingress: FakeNamespace,
    containers: Mutex<HashMap<String, FakeNamespace>>,
    running: Mutex<Vec<ContainerStart>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Result<ContainerStart>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<ContainerStart>>>>,
    shutdowns: AtomicUsize,
    hang_on_enter: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl FakePlatform {
    pub fn new(topology: IngressTopology) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            topology,
            ingress: FakeNamespace::new("ingress_sbox"),
            containers: Mutex::default(),
            running: Mutex::default(),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            shutdowns: AtomicUsize::new(0),
            hang_on_enter: AtomicBool::new(false),
            stopped: watch::channel(false).0,
        }
    }

    /// Make `enter_container` block until `shutdown` is called, like a
    /// `docker inspect` that never returns until its process is killed.
    pub fn hang_until_shutdown(&self) {
        self.hang_on_enter.store(true, Ordering::SeqCst);
    }

    /// Handle to the ingress namespace.
    pub fn ingress(&self) -> FakeNamespace {
        self.ingress.clone()
    }

    /// Register a container's namespace without marking it as running.
    pub fn add_container(&self, id: &str, namespace: FakeNamespace) {
        self.containers
            .lock()
            .expect("containers poisoned")
            .insert(id.to_string(), namespace);
    }

    /// Register a container that was already running before the daemon started.
    pub fn add_running(&self, container: ContainerStart, namespace: FakeNamespace) {
        self.add_container(&container.id, namespace);
        self.running.lock().expect("running poisoned").push(container);
    }

    /// Deliver a live start event.
    pub fn emit(&self, container: ContainerStart) {
        if let Some(tx) = self.sender.lock().expect("sender poisoned").as_ref() {
            let _ = tx.send(Ok(container));
        }
    }

    pub fn emit_error(&self, error: Error) {
        if let Some(tx) = self.sender.lock().expect("sender poisoned").as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the live event stream once queued events are consumed.
    pub fn close_events(&self) {
        self.sender.lock().expect("sender poisoned").take();
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    type Namespace = FakeNamespace;

    async fn detect_topology(&self) -> Result<IngressTopology> {
        Ok(self.topology)
    }

    async fn enter_ingress(&self) -> Result<FakeNamespace> {
        Ok(self.ingress.clone())
    }

    async fn enter_container(&self, id: &str) -> Result<FakeNamespace> {
        if self.hang_on_enter.load(Ordering::SeqCst) {
            let mut stopped = self.stopped.subscribe();
            let _ = stopped.wait_for(|stopped| *stopped).await;
            return Err(Error::CommandFailed {
                command: format!("docker inspect {id}"),
                stderr: "terminated".to_string(),
            });
        }
        self.containers
            .lock()
            .expect("containers poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Namespace {
                path: id.to_string(),
                reason: "no such container".to_string(),
            })
    }

    async fn running_containers(&self) -> Result<Vec<ContainerStart>> {
        Ok(self.running.lock().expect("running poisoned").clone())
    }

    async fn container_starts(&self) -> Result<ContainerStream> {
        let rx = self
            .receiver
            .lock()
            .expect("receiver poisoned")
            .take()
            .ok_or(Error::EventStreamClosed)?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.stopped.send_replace(true);
    }
}
