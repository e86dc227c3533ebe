//! Marking pipeline in the ingress namespace.
//!
//! Packets leaving the load balancer sandbox towards the ingress subnet get
//! this node's identifier written into their TOS byte. They are exempted from
//! IPVS masquerading so containers see the original client address, and
//! inbound traffic can skip connection tracking since return-path identity is
//! carried by the mark.

use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::cleanup;
use crate::config::{MarkingOptions, TrafficScope};
use crate::error::Result;
use crate::firewall::{FirewallRule, Position, Table};
use crate::platform::Namespace;

/// IPVS tuning applied in the ingress namespace unless disabled.
pub const PERFORMANCE_SYSCTLS: [(&str, &str); 3] = [
    ("net.ipv4.vs.conn_reuse_mode", "0"),
    ("net.ipv4.vs.expire_nodest_conn", "1"),
    ("net.ipv4.vs.expire_quiescent_template", "1"),
];

/// The three kinds of rule the pipeline installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    /// Accept IPVS traffic in nat POSTROUTING before it is masqueraded.
    IpvsBypass,
    /// Write the node identifier into the TOS byte.
    TosTag,
    /// Skip connection tracking for inbound traffic.
    NoTrack,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 3] = [
        RuleCategory::IpvsBypass,
        RuleCategory::TosTag,
        RuleCategory::NoTrack,
    ];

    pub fn table(self) -> Table {
        match self {
            RuleCategory::IpvsBypass => Table::Nat,
            RuleCategory::TosTag => Table::Mangle,
            RuleCategory::NoTrack => Table::Raw,
        }
    }

    pub fn chain(self) -> &'static str {
        match self {
            RuleCategory::IpvsBypass | RuleCategory::TosTag => "POSTROUTING",
            RuleCategory::NoTrack => "PREROUTING",
        }
    }

    /// Text every rule of this category contains, whatever its port filter or node id.
    pub fn signature(self) -> &'static str {
        match self {
            RuleCategory::IpvsBypass => "-m ipvs --ipvs -j ACCEPT",
            RuleCategory::TosTag => "-j TOS --set-tos",
            RuleCategory::NoTrack => "-j CT --notrack",
        }
    }

    pub fn position(self) -> Position {
        match self {
            RuleCategory::IpvsBypass | RuleCategory::NoTrack => Position::Insert,
            RuleCategory::TosTag => Position::Append,
        }
    }

    pub fn matches(self, rule: &FirewallRule) -> bool {
        rule.table == self.table()
            && rule.chain == self.chain()
            && rule.spec().contains(self.signature())
    }

    fn rule(self, subnet: Ipv4Net, node_id: u8, scope: &TrafficScope) -> FirewallRule {
        let mut args = Vec::new();
        if self != RuleCategory::NoTrack {
            args.push("-d".to_string());
            args.push(subnet.to_string());
        }
        args.extend(scope.match_args());
        match self {
            RuleCategory::IpvsBypass => {
                args.extend(["-m", "ipvs", "--ipvs", "-j", "ACCEPT"].map(String::from));
            }
            RuleCategory::TosTag => {
                args.extend(["-j", "TOS", "--set-tos"].map(String::from));
                args.push(format!("{node_id:#04x}/0xff"));
            }
            RuleCategory::NoTrack => {
                args.extend(["-j", "CT", "--notrack"].map(String::from));
            }
        }
        FirewallRule::new(self.table(), self.chain(), args)
    }
}

/// Rules to install for `node_id`, in installation order.
pub fn marking_rules(
    subnet: Ipv4Net,
    node_id: u8,
    options: &MarkingOptions,
) -> Vec<(FirewallRule, Position)> {
    let mut rules = Vec::new();
    for scope in &options.scopes {
        for category in RuleCategory::ALL {
            if category == RuleCategory::NoTrack && !options.performance {
                continue;
            }
            rules.push((category.rule(subnet, node_id, scope), category.position()));
        }
    }
    rules
}

/// Install the marking pipeline for this node. Earlier rules are cleaned up
/// first, so repeated runs never accumulate duplicates.
pub async fn install<N: Namespace + ?Sized>(
    ns: &N,
    subnet: Ipv4Net,
    node_id: u8,
    options: &MarkingOptions,
) -> Result<()> {
    cleanup::remove_marking_rules(ns).await?;

    for (rule, position) in marking_rules(subnet, node_id, options) {
        ns.add_firewall_rule(&rule, position).await?;
    }
    for scope in &options.scopes {
        info!(namespace = ns.label(), node_id, %scope, "Marking rules installed");
    }

    if options.performance {
        for (key, value) in PERFORMANCE_SYSCTLS {
            // IPVS sysctls only exist once the ip_vs module is loaded.
            if let Err(e) = ns.set_sysctl(key, value).await {
                warn!(namespace = ns.label(), key, error = %e, "Failed to apply IPVS tuning");
            }
        }
    }

    Ok(())
}
