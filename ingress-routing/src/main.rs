//! ingress-routing-daemon: keeps container return paths pointed at the swarm
//! ingress node each connection arrived through.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use ingress_routing::config::{Config, Mode, ServiceFilter};
use ingress_routing::registry::GatewayEntry;
use ingress_routing::{DockerPlatform, Platform, ProcessRegistry, daemon};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Return-path routing for swarm ingress
#[derive(Parser, Debug)]
#[command(name = "ingress-routing-daemon", version, about)]
#[command(group(ArgGroup::new("mode").required(true).args(["install", "uninstall"])))]
struct Args {
    /// Install marking rules and configure containers as they start
    #[arg(long)]
    install: bool,

    /// Remove marking rules from the ingress namespace and exit
    #[arg(long)]
    uninstall: bool,

    /// Only configure containers of these services (comma separated)
    #[arg(long, value_delimiter = ',')]
    services: Vec<String>,

    /// Restrict marking to these TCP ports (comma separated)
    #[arg(long, value_delimiter = ',')]
    tcp_ports: Vec<u16>,

    /// Restrict marking to these UDP ports (comma separated)
    #[arg(long, value_delimiter = ',')]
    udp_ports: Vec<u16>,

    /// Ingress addresses of all load balancer nodes, in order. Use `null` for
    /// a retired node whose position must be kept.
    #[arg(long, value_delimiter = ',')]
    ingress_gateway_ips: Vec<GatewayEntry>,

    /// Skip IPVS sysctl tuning and keep connection tracking for inbound traffic
    #[arg(long)]
    no_performance: bool,

    /// Derive identifiers from list position instead of the last address octet
    #[arg(long)]
    indexed_ids: bool,

    /// Also configure containers that are already running
    #[arg(long)]
    preexisting: bool,

    /// Wait for the xtables lock instead of failing
    #[arg(long)]
    iptables_wait: bool,

    /// Name of the swarm ingress network
    #[arg(long, default_value = "ingress")]
    ingress_network: String,

    /// Path to the docker CLI
    #[arg(long, default_value = "docker")]
    docker: PathBuf,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            mode: if self.uninstall {
                Mode::Uninstall
            } else {
                Mode::Install
            },
            services: ServiceFilter::new(self.services),
            tcp_ports: self.tcp_ports,
            udp_ports: self.udp_ports,
            gateways: self.ingress_gateway_ips,
            performance: !self.no_performance,
            indexed_ids: self.indexed_ids,
            preexisting: self.preexisting,
            iptables_wait: self.iptables_wait,
            ingress_network: self.ingress_network,
            docker: self.docker,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingress_routing=info,ingress_routing_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config();

    let platform = Arc::new(DockerPlatform::new(
        config.docker.clone(),
        config.ingress_network.clone(),
        config.iptables_wait,
        ProcessRegistry::new(),
    ));

    if config.mode == Mode::Uninstall {
        daemon::uninstall(platform.as_ref())
            .await
            .context("Failed to remove marking rules")?;
        return Ok(());
    }

    // Every signal terminates the processes we spawned right away, so an
    // install blocked on one of them fails instead of delaying shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let signalled = Arc::clone(&platform);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => { info!("Received SIGINT"); }
                _ = sigterm.recv() => { info!("Received SIGTERM"); }
            }
            signalled.shutdown();
            let _ = shutdown_tx.send(true);
        }
    });

    daemon::run(platform, &config, shutdown_rx)
        .await
        .context("ingress-routing-daemon failed")
}
