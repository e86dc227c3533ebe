//! Network namespace access for the docker backend.
//!
//! Firewall and routing changes run as `nsenter --net=<path> <tool>`. Sysctls
//! are read and written from a dedicated OS thread that has joined the
//! namespace, since `/proc/sys/net` resolves against the calling thread.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::sched::{CloneFlags, setns};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::firewall::{self, FirewallRule, Position, Table};
use crate::platform::Namespace;
use crate::process::ProcessRegistry;
use crate::routing::{self, InterfaceAddr, Route, RoutingRule};

/// Network namespace of docker's ingress load balancer sandbox.
pub const INGRESS_NETNS: &str = "/var/run/docker/netns/ingress_sbox";

/// A network namespace entered through `nsenter`.
#[derive(Debug, Clone)]
pub struct NsenterNamespace {
    path: PathBuf,
    label: String,
    iptables_wait: bool,
    processes: ProcessRegistry,
}

impl NsenterNamespace {
    /// Open the namespace at `path`. The namespace file must exist.
    pub fn open(
        path: impl Into<PathBuf>,
        iptables_wait: bool,
        processes: ProcessRegistry,
    ) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::Namespace {
                path: path.display().to_string(),
                reason: "no such namespace".to_string(),
            });
        }
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            path,
            label,
            iptables_wait,
            processes,
        })
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new("nsenter");
        cmd.arg(format!("--net={}", self.path.display())).arg(program);
        cmd
    }

    fn iptables(&self, args: &[String]) -> Command {
        let mut cmd = self.command("iptables");
        if self.iptables_wait {
            cmd.arg("--wait");
        }
        cmd.args(args);
        cmd
    }

    fn ip(&self, args: &[String]) -> Command {
        let mut cmd = self.command("ip");
        cmd.args(args);
        cmd
    }
}

#[async_trait]
impl Namespace for NsenterNamespace {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list_firewall_rules(&self, table: Table) -> Result<Vec<FirewallRule>> {
        let args = ["-t".to_string(), table.as_str().to_string(), "-S".to_string()];
        let output = self.processes.run(&mut self.iptables(&args)).await?;
        firewall::parse_listing(table, &output)
    }

    async fn add_firewall_rule(&self, rule: &FirewallRule, position: Position) -> Result<()> {
        let check = self
            .processes
            .output(&mut self.iptables(&rule.command_args("-C")))
            .await?;
        if check.status.success() {
            debug!(namespace = %self.label, rule = %rule, "Rule already present");
            return Ok(());
        }

        self.processes
            .run(&mut self.iptables(&rule.command_args(position.flag())))
            .await?;
        Ok(())
    }

    async fn delete_firewall_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.processes
            .run(&mut self.iptables(&rule.command_args("-D")))
            .await?;
        Ok(())
    }

    async fn list_routing_rules(&self) -> Result<Vec<RoutingRule>> {
        let args = ["rule".to_string(), "show".to_string()];
        let output = self.processes.run(&mut self.ip(&args)).await?;
        Ok(routing::parse_rules(&output))
    }

    async fn add_routing_rule(&self, rule: &RoutingRule) -> Result<()> {
        self.processes.run(&mut self.ip(&rule.add_args())).await?;
        Ok(())
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        self.processes
            .run(&mut self.ip(&route.replace_args()))
            .await?;
        Ok(())
    }

    async fn interface_addrs(&self) -> Result<Vec<InterfaceAddr>> {
        let args = ["-o", "-4", "addr", "show"].map(String::from);
        let output = self.processes.run(&mut self.ip(&args)).await?;
        Ok(routing::parse_addrs(&output))
    }

    async fn get_sysctl(&self, key: &str) -> Result<String> {
        let file = sysctl_path(key);
        run_in_namespace(self.path.clone(), move || {
            Ok(std::fs::read_to_string(&file)?.trim().to_string())
        })
        .await
    }

    async fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
        debug!(namespace = %self.label, key, value, "Setting sysctl");
        let file = sysctl_path(key);
        let value = value.to_string();
        run_in_namespace(self.path.clone(), move || {
            std::fs::write(&file, value)?;
            Ok(())
        })
        .await
    }
}

/// `/proc/sys` path for a dotted sysctl key.
fn sysctl_path(key: &str) -> PathBuf {
    Path::new("/proc/sys").join(key.replace('.', "/"))
}

/// Run `task` on a fresh OS thread that has joined the network namespace at
/// `path`. The thread exits afterwards, so no runtime thread changes namespace.
async fn run_in_namespace<T, F>(path: PathBuf, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let label = path.display().to_string();

    std::thread::spawn(move || {
        let result = File::open(&path)
            .map_err(Error::from)
            .and_then(|ns| setns(&ns, CloneFlags::CLONE_NEWNET).map_err(Error::from))
            .and_then(|()| task());
        let _ = tx.send(result);
    });

    rx.await.map_err(|_| Error::Namespace {
        path: label,
        reason: "namespace thread exited without a result".to_string(),
    })?
}
