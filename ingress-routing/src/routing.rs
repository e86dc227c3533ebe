//! Policy routing rules, per-table routes and interface addresses.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::debug;

/// `ip rule` selecting `table` for packets from `from` carrying `fwmark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingRule {
    pub priority: u32,
    pub from: Ipv4Net,
    pub fwmark: u32,
    pub table: u32,
}

impl RoutingRule {
    /// Arguments for `ip rule add`.
    pub fn add_args(&self) -> Vec<String> {
        vec![
            "rule".to_string(),
            "add".to_string(),
            "from".to_string(),
            self.from.to_string(),
            "fwmark".to_string(),
            format!("{:#x}", self.fwmark),
            "lookup".to_string(),
            self.table.to_string(),
            "priority".to_string(),
            self.priority.to_string(),
        ]
    }
}

impl fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: from {} fwmark {:#x} lookup {}",
            self.priority, self.from, self.fwmark, self.table
        )
    }
}

/// Default route in a numbered table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub table: u32,
    pub via: Ipv4Addr,
    pub dev: String,
}

impl Route {
    /// Arguments for `ip route replace`.
    pub fn replace_args(&self) -> Vec<String> {
        vec![
            "route".to_string(),
            "replace".to_string(),
            "default".to_string(),
            "via".to_string(),
            self.via.to_string(),
            "dev".to_string(),
            self.dev.clone(),
            "table".to_string(),
            self.table.to_string(),
        ]
    }
}

/// An IPv4 address configured on an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Net,
}

/// Parse `ip rule show` output.
///
/// Only rules with a source prefix, a firewall mark and a numeric table are
/// returned; everything else cannot have been installed by us.
pub fn parse_rules(output: &str) -> Vec<RoutingRule> {
    output.lines().filter_map(parse_rule_line).collect()
}

fn parse_rule_line(line: &str) -> Option<RoutingRule> {
    let mut words = line.split_whitespace();
    let priority = words.next()?.trim_end_matches(':').parse().ok()?;

    let mut from = None;
    let mut fwmark = None;
    let mut table = None;
    while let Some(key) = words.next() {
        match key {
            "from" => from = parse_prefix(words.next()?),
            "fwmark" => fwmark = parse_mark(words.next()?),
            "lookup" | "table" => table = words.next()?.parse().ok(),
            _ => {}
        }
    }

    Some(RoutingRule {
        priority,
        from: from?,
        fwmark: fwmark?,
        table: table?,
    })
}

fn parse_prefix(s: &str) -> Option<Ipv4Net> {
    s.parse()
        .ok()
        .or_else(|| s.parse::<Ipv4Addr>().ok().map(Ipv4Net::from))
}

fn parse_mark(s: &str) -> Option<u32> {
    let value = s.split('/').next()?;
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Parse `ip -o -4 addr show` output.
///
/// Example line:
/// `12: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\       valid_lft forever`
pub fn parse_addrs(output: &str) -> Vec<InterfaceAddr> {
    let mut addrs = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parse_addr_line(line) {
            Some(addr) => addrs.push(addr),
            None => debug!(line, "Skipping unrecognized address line"),
        }
    }
    addrs
}

fn parse_addr_line(line: &str) -> Option<InterfaceAddr> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() < 4 || words[2] != "inet" {
        return None;
    }
    let name = words[1].split('@').next().unwrap_or(words[1]);
    Some(InterfaceAddr {
        name: name.to_string(),
        addr: words[3].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let output = "\
0:\tfrom all lookup local
32700:\tfrom 10.0.0.0/24 fwmark 0x3 lookup 3
32766:\tfrom all lookup main
32767:\tfrom all lookup default
";
        let rules = parse_rules(output);
        assert_eq!(
            rules,
            vec![RoutingRule {
                priority: 32700,
                from: "10.0.0.0/24".parse().unwrap(),
                fwmark: 3,
                table: 3,
            }]
        );
    }

    #[test]
    fn test_parse_rule_with_mask_and_host_source() {
        let rules = parse_rules("100:\tfrom 10.0.0.7 fwmark 0x10/0xff lookup 16\n");
        assert_eq!(rules[0].from, "10.0.0.7/32".parse::<Ipv4Net>().unwrap());
        assert_eq!(rules[0].fwmark, 16);
    }

    #[test]
    fn test_rule_args_roundtrip_through_listing() {
        let rule = RoutingRule {
            priority: 32700,
            from: "10.0.0.0/24".parse().unwrap(),
            fwmark: 1,
            table: 1,
        };
        assert_eq!(
            rule.add_args().join(" "),
            "rule add from 10.0.0.0/24 fwmark 0x1 lookup 1 priority 32700"
        );
        assert_eq!(parse_rules(&rule.to_string()), vec![rule]);
    }

    #[test]
    fn test_parse_addrs() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
24: eth0@if25    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\\       valid_lft forever preferred_lft forever
";
        let addrs = parse_addrs(output);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].name, "eth0");
        assert_eq!(addrs[1].addr, "10.0.0.5/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_parse_addrs_skips_point_to_point() {
        let output = "\
3: ppp0    inet 10.0.0.5 peer 10.0.0.6/32 scope global ppp0\\       valid_lft forever preferred_lft forever
24: eth1@if25    inet 10.0.0.7/24 brd 10.0.0.255 scope global eth1\\       valid_lft forever preferred_lft forever
";
        let addrs = parse_addrs(output);
        assert_eq!(
            addrs,
            vec![InterfaceAddr {
                name: "eth1".to_string(),
                addr: "10.0.0.7/24".parse().unwrap(),
            }]
        );
    }
}
