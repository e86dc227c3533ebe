//! Daemon flows: uninstall, and install followed by the watch loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::platform::Platform;
use crate::registry::{self, Registry};
use crate::return_path::ReturnPathInstaller;
use crate::watcher::Watcher;
use crate::{cleanup, marking, topology};

/// Delay before the watcher is restarted after its event stream failed.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Remove marking rules from the ingress namespace. Containers are not touched.
pub async fn uninstall<P: Platform + ?Sized>(platform: &P) -> Result<usize> {
    let ingress = platform.enter_ingress().await?;
    let removed = cleanup::remove_marking_rules(&ingress).await?;
    info!(removed, "Uninstall complete");
    Ok(removed)
}

/// Resolve this node's identity and set up the ingress namespace.
///
/// Topology and configuration are checked before the ingress namespace is
/// entered, so a bad configuration changes nothing. Marking rules are only
/// installed when this node is one of the configured load balancers; on
/// other nodes stale rules are removed.
pub async fn prepare<P: Platform + ?Sized>(
    platform: &P,
    config: &Config,
) -> Result<ReturnPathInstaller> {
    if config.gateways.is_empty() {
        return Err(ConfigError::NoGateways.into());
    }

    let topology = topology::detect(platform).await?;
    let registry = Registry::resolve(
        &config.gateways,
        registry::id_mode(&topology, config.indexed_ids),
    )?;
    let node_id = registry.id_of(topology.node_addr);

    let ids: Vec<String> = registry
        .active()
        .iter()
        .map(|n| format!("{}={}", n.addr, n.id))
        .collect();
    info!(
        subnet = %topology.subnet,
        node_addr = %topology.node_addr,
        id_mode = %registry.mode(),
        ids = %ids.join(","),
        load_balancer = node_id.is_some(),
        "Starting ingress-routing-daemon"
    );

    match node_id {
        Some(id) => {
            let ingress = platform.enter_ingress().await?;
            marking::install(&ingress, topology.subnet, id, &config.marking_options()).await?;
        }
        None => {
            info!("Node is not a load balancer, no marking rules installed");
            match platform.enter_ingress().await {
                Ok(ingress) => {
                    if let Err(e) = cleanup::remove_marking_rules(&ingress).await {
                        warn!(error = %e, "Failed to remove stale marking rules");
                    }
                }
                Err(e) => warn!(error = %e, "Ingress namespace unavailable, skipping cleanup"),
            }
        }
    }

    Ok(ReturnPathInstaller::new(
        &topology,
        &registry,
        config.services.clone(),
    ))
}

/// Prepare, then watch container starts until `shutdown` turns true.
///
/// A watcher whose event stream failed is restarted after [`RESTART_DELAY`].
pub async fn run<P: Platform + 'static>(
    platform: Arc<P>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let installer = prepare(platform.as_ref(), config).await?;
    let watcher = Watcher::new(Arc::clone(&platform), installer, config.preexisting);

    loop {
        let mut stop = shutdown.clone();
        let stopped = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };

        match watcher.run(stopped).await {
            Ok(()) => break,
            Err(e) => {
                error!(error = %e, "Watcher stopped, restarting in 5 seconds");
                let mut stop = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                    _ = stop.wait_for(|stopped| *stopped) => break,
                }
            }
        }
    }

    info!("ingress-routing-daemon stopped");
    Ok(())
}
