//! Docker backend for the platform interface.
//!
//! Talks to the docker CLI: `network inspect` for topology, `inspect` for a
//! container's namespace, `ps` for the running set and a long-lived `events`
//! child for start notifications.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use ipnet::Ipv4Net;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SERVICE_LABEL;
use crate::error::{Error, Result};
use crate::netns::{INGRESS_NETNS, NsenterNamespace};
use crate::platform::{ContainerStart, ContainerStream, Platform};
use crate::process::ProcessRegistry;
use crate::topology::IngressTopology;

/// Endpoint name of the ingress load balancer sandbox in the ingress network.
const INGRESS_SANDBOX_ENDPOINT: &str = "ingress-sbox";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
    #[serde(rename = "IPAM")]
    ipam: Ipam,
    #[serde(default)]
    containers: HashMap<String, NetworkEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ipam {
    #[serde(default)]
    config: Vec<IpamConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpamConfig {
    subnet: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkEndpoint {
    #[serde(default)]
    name: String,
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    sandbox_key: String,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor")]
    actor: Actor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Actor {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// Parse `docker network inspect <ingress>` output.
pub fn parse_network_inspect(json: &str) -> Result<IngressTopology> {
    let networks: Vec<NetworkInspect> = serde_json::from_str(json)
        .map_err(|e| Error::TopologyUnavailable(format!("invalid network inspect output: {e}")))?;
    let network = networks
        .into_iter()
        .next()
        .ok_or_else(|| Error::TopologyUnavailable("ingress network not found".to_string()))?;

    let subnet: Ipv4Net = network
        .ipam
        .config
        .first()
        .ok_or_else(|| Error::TopologyUnavailable("ingress network has no subnet".to_string()))?
        .subnet
        .parse()
        .map_err(|e| Error::TopologyUnavailable(format!("invalid ingress subnet: {e}")))?;

    let endpoint = network
        .containers
        .iter()
        .find(|(key, ep)| *key == INGRESS_SANDBOX_ENDPOINT || ep.name == INGRESS_SANDBOX_ENDPOINT)
        .map(|(_, ep)| ep)
        .ok_or_else(|| {
            Error::TopologyUnavailable("no ingress-sbox endpoint on this node".to_string())
        })?;
    let node_addr: Ipv4Addr = endpoint
        .ipv4_address
        .split('/')
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|e| Error::TopologyUnavailable(format!("invalid ingress-sbox address: {e}")))?;

    Ok(IngressTopology {
        subnet: subnet.trunc(),
        node_addr,
    })
}

/// Parse `docker inspect <container>` output into the namespace path.
pub fn parse_sandbox_key(json: &str) -> Result<PathBuf> {
    let containers: Vec<ContainerInspect> = serde_json::from_str(json)
        .map_err(|e| Error::parse("container inspect", e.to_string()))?;
    let key = containers
        .into_iter()
        .next()
        .map(|c| c.network_settings.sandbox_key)
        .unwrap_or_default();
    if key.is_empty() {
        return Err(Error::parse("container inspect", "container has no network sandbox"));
    }
    Ok(PathBuf::from(key))
}

/// Parse `docker ps --format '{{.ID}}\t{{.Label "..."}}'` output.
pub fn parse_ps(output: &str) -> Vec<ContainerStart> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(2, '\t');
            let id = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            let service = fields.next().map(str::trim).filter(|s| !s.is_empty());
            Some(ContainerStart::new(id, service))
        })
        .collect()
}

/// Parse one line of `docker events --format '{{json .}}'`.
///
/// Returns `None` for events other than a container start.
pub fn parse_event(line: &str) -> Result<Option<ContainerStart>> {
    let event: Event =
        serde_json::from_str(line).map_err(|e| Error::parse("docker event", e.to_string()))?;
    if event.action != "start" {
        return Ok(None);
    }
    let service = event.actor.attributes.get(SERVICE_LABEL).map(String::as_str);
    Ok(Some(ContainerStart::new(event.actor.id, service)))
}

/// Platform backed by the local docker daemon.
#[derive(Debug, Clone)]
pub struct DockerPlatform {
    docker: PathBuf,
    ingress_network: String,
    iptables_wait: bool,
    processes: ProcessRegistry,
}

impl DockerPlatform {
    pub fn new(
        docker: PathBuf,
        ingress_network: String,
        iptables_wait: bool,
        processes: ProcessRegistry,
    ) -> Self {
        Self {
            docker,
            ingress_network,
            iptables_wait,
            processes,
        }
    }

    fn docker(&self) -> Command {
        Command::new(&self.docker)
    }

    fn namespace(&self, path: impl Into<PathBuf>) -> Result<NsenterNamespace> {
        NsenterNamespace::open(path, self.iptables_wait, self.processes.clone())
    }
}

#[async_trait]
impl Platform for DockerPlatform {
    type Namespace = NsenterNamespace;

    async fn detect_topology(&self) -> Result<IngressTopology> {
        let output = self
            .processes
            .run(
                self.docker()
                    .args(["network", "inspect", self.ingress_network.as_str()]),
            )
            .await
            .map_err(|e| Error::TopologyUnavailable(e.to_string()))?;
        parse_network_inspect(&output)
    }

    async fn enter_ingress(&self) -> Result<NsenterNamespace> {
        self.namespace(INGRESS_NETNS)
    }

    async fn enter_container(&self, id: &str) -> Result<NsenterNamespace> {
        let output = self
            .processes
            .run(self.docker().args(["inspect", id]))
            .await?;
        let path = parse_sandbox_key(&output)?;
        debug!(container = %id, namespace = %path.display(), "Resolved container namespace");
        self.namespace(path)
    }

    async fn running_containers(&self) -> Result<Vec<ContainerStart>> {
        let format = format!("{{{{.ID}}}}\t{{{{.Label \"{SERVICE_LABEL}\"}}}}");
        let output = self
            .processes
            .run(self.docker().args(["ps", "--no-trunc", "--format", format.as_str()]))
            .await?;
        Ok(parse_ps(&output))
    }

    async fn container_starts(&self) -> Result<ContainerStream> {
        let mut tracked = self.processes.spawn(self.docker().args([
            "events",
            "--filter",
            "type=container",
            "--filter",
            "event=start",
            "--format",
            "{{json .}}",
        ]))?;
        let stdout = tracked.child_mut().stdout.take().ok_or_else(|| Error::Command {
            program: "docker events".to_string(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        info!("Subscribed to container start events");

        let stream = async_stream::stream! {
            // Keeps the child registered (and alive) for as long as the stream is.
            let _tracked = tracked;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_event(&line) {
                        Ok(Some(start)) => yield Ok(start),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Ignoring malformed docker event"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Io(e));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    fn shutdown(&self) {
        let signalled = self.processes.terminate_all();
        if signalled > 0 {
            info!(count = signalled, "Terminated child processes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK_INSPECT: &str = r#"[{
        "Name": "ingress",
        "IPAM": {"Driver": "default", "Config": [{"Subnet": "10.0.0.0/24", "Gateway": "10.0.0.1"}]},
        "Containers": {
            "3f1c": {"Name": "web.1.abc", "IPv4Address": "10.0.0.7/24"},
            "ingress-sbox": {"Name": "ingress-endpoint", "IPv4Address": "10.0.0.2/24"}
        }
    }]"#;

    #[test]
    fn test_parse_network_inspect() {
        let topology = parse_network_inspect(NETWORK_INSPECT).unwrap();
        assert_eq!(topology.subnet, "10.0.0.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(topology.node_addr, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_parse_network_inspect_without_sandbox() {
        let json = r#"[{"IPAM": {"Config": [{"Subnet": "10.0.0.0/24"}]}, "Containers": {}}]"#;
        assert!(matches!(
            parse_network_inspect(json),
            Err(Error::TopologyUnavailable(_))
        ));
        assert!(matches!(
            parse_network_inspect("[]"),
            Err(Error::TopologyUnavailable(_))
        ));
    }

    #[test]
    fn test_parse_sandbox_key() {
        let json = r#"[{"Id": "abc", "NetworkSettings": {"SandboxKey": "/var/run/docker/netns/5e2f"}}]"#;
        assert_eq!(
            parse_sandbox_key(json).unwrap(),
            PathBuf::from("/var/run/docker/netns/5e2f")
        );

        let stopped = r#"[{"Id": "abc", "NetworkSettings": {"SandboxKey": ""}}]"#;
        assert!(parse_sandbox_key(stopped).is_err());
    }

    #[test]
    fn test_parse_ps() {
        let output = "aaa\tweb\nbbb\t\n\n";
        assert_eq!(
            parse_ps(output),
            vec![
                ContainerStart::new("aaa", Some("web")),
                ContainerStart::new("bbb", None),
            ]
        );
    }

    #[test]
    fn test_parse_event() {
        let line = r#"{"status":"start","id":"abc","Type":"container","Action":"start","Actor":{"ID":"abc","Attributes":{"com.docker.swarm.service.name":"web","image":"nginx"}}}"#;
        assert_eq!(
            parse_event(line).unwrap(),
            Some(ContainerStart::new("abc", Some("web")))
        );

        let die = r#"{"Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{}}}"#;
        assert_eq!(parse_event(die).unwrap(), None);

        assert!(parse_event("not json").is_err());
    }
}
