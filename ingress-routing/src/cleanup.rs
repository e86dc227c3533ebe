//! Removal of previously installed marking rules.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::Result;
use crate::firewall::Table;
use crate::marking::RuleCategory;
use crate::platform::Namespace;

/// Delete every marking rule in the namespace, whatever port filter or node
/// identifier it was installed with. Returns the number of rules removed.
pub async fn remove_marking_rules<N: Namespace + ?Sized>(ns: &N) -> Result<usize> {
    let tables: BTreeSet<Table> = RuleCategory::ALL.iter().map(|c| c.table()).collect();

    let mut removed = 0;
    for table in tables {
        for rule in ns.list_firewall_rules(table).await? {
            if RuleCategory::ALL.iter().any(|c| c.matches(&rule)) {
                debug!(namespace = ns.label(), rule = %rule, "Removing marking rule");
                ns.delete_firewall_rule(&rule).await?;
                removed += 1;
            }
        }
    }

    info!(namespace = ns.label(), removed, "Marking rules cleaned up");
    Ok(removed)
}
