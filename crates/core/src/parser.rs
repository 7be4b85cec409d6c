//! Parser for rule source strings: `host:port=target(,host:port=target)*`.
//!
//! Malformed entries are skipped with a warning and parsing continues. An
//! entry with an empty right-hand side ends the rule list.

use tracing::{debug, info, warn};

use crate::endpoint::{EndpointKey, WILDCARD};
use crate::rules::RuleTable;

/// Parse `source` into `table`, returning the number of entries inserted.
pub fn parse_into(table: &mut RuleTable, source: &str) -> usize {
    let mut inserted = 0;

    for entry in source.split(',').filter(|e| !e.is_empty()) {
        if entry.matches('=').count() != 1 {
            warn!(entry, "ignoring malformed rule: expected exactly one '='");
            continue;
        }
        let Some((addr, target)) = entry.split_once('=') else {
            continue;
        };

        if addr.matches(':').count() != 1 {
            warn!(entry = addr, "ignoring malformed rule: expected exactly one ':'");
            continue;
        }

        if target.is_empty() {
            debug!(entry, "rule without target, ignoring the rest of the list");
            break;
        }

        let Some((host, port)) = addr.split_once(':') else {
            continue;
        };
        let host = if host.is_empty() { WILDCARD } else { host };
        let port = if port.is_empty() { WILDCARD } else { port };

        let key = EndpointKey::new(host, port);
        if !key.is_matchable() {
            warn!(%key, "rule key can never match an IPv4 endpoint");
        }
        info!(%key, target, "add mapping");
        table.insert(key, target.to_string());
        inserted += 1;
    }

    inserted
}

impl RuleTable {
    /// Build a table from an optional rule source. `None` yields an empty table.
    pub fn from_source(source: Option<&str>) -> Self {
        let mut table = RuleTable::new();
        if let Some(source) = source {
            parse_into(&mut table, source);
        }
        table
    }
}
