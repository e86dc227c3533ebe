//! Error types for the ingress routing daemon.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Main error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Ingress topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to execute {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("Namespace {path} unavailable: {reason}")]
    Namespace { path: String, reason: String },

    #[error("Container event stream closed")]
    EventStreamClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

/// Configuration errors. All of these are raised before any rule is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid load balancer address '{0}'")]
    InvalidAddress(String),

    #[error("Identifier {id} for {addr} does not fit in 1-255")]
    IdOutOfRange { addr: Ipv4Addr, id: usize },

    #[error("Identifier {id} for {addr} collides with reserved routing table {id}")]
    ReservedTable { addr: Ipv4Addr, id: u8 },

    #[error("Identifier {id} assigned to both {first} and {second}; use --indexed-ids")]
    DuplicateId {
        id: u8,
        first: Ipv4Addr,
        second: Ipv4Addr,
    },

    #[error("Address {0} listed more than once")]
    DuplicateAddress(Ipv4Addr),

    #[error("No load balancer addresses configured (--ingress-gateway-ips)")]
    NoGateways,
}

impl Error {
    pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Error::Parse {
            what,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
