//! ingress-routing: return-path routing for containers behind a swarm
//! ingress load balancer.
//!
//! Without it, replies from a container leave through whatever default
//! gateway the container has, not through the node that balanced the
//! connection in, so the client sees them from the wrong address. Each load
//! balancer node tags outgoing packets with its identifier; containers
//! remember the tag per connection and route replies back via that node.
//!
//! # Architecture
//!
//! ```text
//! client --> LB node K (ingress_sbox) --TOS=K--> container (ingress iface)
//!                                                    |
//!                                          CONNMARK K, restore on reply
//!                                                    |
//!                                   ip rule fwmark K -> table K -> via node K
//! ```
//!
//! The installers only use the [`platform`] traits; [`docker`] implements
//! them with the docker CLI and `nsenter`.

pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod docker;
pub mod error;
pub mod firewall;
pub mod marking;
pub mod netns;
pub mod platform;
pub mod process;
pub mod registry;
pub mod return_path;
pub mod routing;
pub mod topology;
pub mod watcher;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use config::{Config, MarkingOptions, Mode, Protocol, ServiceFilter, TrafficScope};
pub use docker::DockerPlatform;
pub use error::{ConfigError, Error, Result};
pub use platform::{ContainerStart, Namespace, Platform};
pub use process::ProcessRegistry;
pub use registry::{GatewayEntry, IdMode, Registry};
pub use return_path::{InstallOutcome, ReturnPathInstaller};
pub use topology::IngressTopology;
pub use watcher::Watcher;
