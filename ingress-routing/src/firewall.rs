//! Typed iptables rules.
//!
//! Rules are kept as the argument list iptables itself prints with `-S`, so a
//! listed rule can be handed straight back for deletion.

use std::fmt;

use crate::error::{Error, Result};

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Raw,
    Mangle,
    Nat,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Raw => "raw",
            Table::Mangle => "mangle",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a new rule goes in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Head of the chain (`-I`).
    Insert,
    /// Tail of the chain (`-A`).
    Append,
}

impl Position {
    pub fn flag(self) -> &'static str {
        match self {
            Position::Insert => "-I",
            Position::Append => "-A",
        }
    }
}

/// A single rule: table, chain and the match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: String,
    pub args: Vec<String>,
}

impl FirewallRule {
    pub fn new<I, S>(table: Table, chain: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            chain: chain.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Rule arguments joined the way `iptables -S` prints them.
    pub fn spec(&self) -> String {
        self.args.join(" ")
    }

    /// Arguments for `iptables -t <table>` performing `action` on this rule.
    pub fn command_args(&self, action: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 4);
        args.push("-t".to_string());
        args.push(self.table.as_str().to_string());
        args.push(action.to_string());
        args.push(self.chain.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", self.table, self.chain, self.spec())
    }
}

/// Parse `iptables -t <table> -S` output. Policy and chain declarations are skipped.
pub fn parse_listing(table: Table, output: &str) -> Result<Vec<FirewallRule>> {
    let mut rules = Vec::new();
    for line in output.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("-A") => {
                let chain = words
                    .next()
                    .ok_or_else(|| Error::parse("iptables rule", line))?;
                rules.push(FirewallRule::new(table, chain, words));
            }
            Some("-P" | "-N") | None => {}
            Some(_) => return Err(Error::parse("iptables rule", line)),
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANGLE_LISTING: &str = "\
-P PREROUTING ACCEPT
-P POSTROUTING ACCEPT
-N CUSTOM
-A POSTROUTING -d 10.0.0.0/24 -j TOS --set-tos 0x02/0xff
-A OUTPUT -p tcp -j CONNMARK --restore-mark --nfmask 0xffffffff --ctmask 0xffffffff
";

    #[test]
    fn test_parse_listing() {
        let rules = parse_listing(Table::Mangle, MANGLE_LISTING).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].chain, "POSTROUTING");
        assert_eq!(rules[0].spec(), "-d 10.0.0.0/24 -j TOS --set-tos 0x02/0xff");
        assert_eq!(rules[1].table, Table::Mangle);
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        assert!(parse_listing(Table::Raw, "iptables: No chain/target/match").is_err());
    }

    #[test]
    fn test_command_args() {
        let rule = FirewallRule::new(Table::Raw, "PREROUTING", ["-j", "CT", "--notrack"]);
        assert_eq!(
            rule.command_args("-D"),
            vec!["-t", "raw", "-D", "PREROUTING", "-j", "CT", "--notrack"]
        );
        assert_eq!(rule.to_string(), "-t raw -A PREROUTING -j CT --notrack");
    }
}
