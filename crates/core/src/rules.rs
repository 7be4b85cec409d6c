//! Rule table: endpoint key → target descriptor, with tiered wildcard lookup.

use std::collections::HashMap;

use crate::endpoint::{Endpoint, EndpointKey};

/// One direction's redirection rules.
///
/// Keys are unique; inserting an existing key replaces its target but keeps
/// its original iteration position.
#[derive(Clone, Debug, Default)]
pub struct RuleTable {
    targets: HashMap<EndpointKey, String>,
    order: Vec<EndpointKey>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, returning the target it replaced.
    pub fn insert(&mut self, key: EndpointKey, target: String) -> Option<String> {
        if let Some(previous) = self.targets.get_mut(&key) {
            return Some(std::mem::replace(previous, target));
        }
        self.order.push(key.clone());
        self.targets.insert(key, target);
        None
    }

    pub fn get(&self, key: &EndpointKey) -> Option<&str> {
        self.targets.get(key).map(String::as_str)
    }

    /// Resolve `endpoint` against the table: the first hit among its
    /// candidate keys wins, so specific rules are never shadowed by broader
    /// ones.
    pub fn lookup(&self, endpoint: &Endpoint) -> Option<&str> {
        endpoint.candidates().iter().find_map(|key| self.get(key))
    }

    /// Entries in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&EndpointKey, &str)> {
        self.order
            .iter()
            .filter_map(|key| self.targets.get_key_value(key))
            .map(|(key, target)| (key, target.as_str()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn table(entries: &[(&str, &str, &str)]) -> RuleTable {
        let mut table = RuleTable::new();
        for (host, port, target) in entries {
            table.insert(EndpointKey::new(host, port), target.to_string());
        }
        table
    }

    fn at(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint::v4(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn catch_all_matches_everything() {
        let table = table(&[("*", "*", "/target")]);
        for endpoint in [
            at(0, 0, 0, 0, 0),
            at(127, 0, 0, 1, 80),
            at(255, 255, 255, 255, 65535),
            Endpoint {
                host: None,
                port: 22,
            },
        ] {
            assert_eq!(table.lookup(&endpoint), Some("/target"), "{endpoint}");
        }
    }

    #[test]
    fn exact_beats_wildcard_host() {
        let table = table(&[("*", "80", "/b"), ("10.0.0.1", "80", "/a")]);
        assert_eq!(table.lookup(&at(10, 0, 0, 1, 80)), Some("/a"));
        assert_eq!(table.lookup(&at(10, 0, 0, 2, 80)), Some("/b"));
    }

    #[test]
    fn wildcard_host_beats_wildcard_port() {
        let table = table(&[("10.0.0.1", "*", "/c"), ("*", "80", "/b")]);
        assert_eq!(table.lookup(&at(10, 0, 0, 1, 80)), Some("/b"));
        assert_eq!(table.lookup(&at(10, 0, 0, 1, 81)), Some("/c"));
    }

    #[test]
    fn precedence_across_all_tiers() {
        let full = table(&[
            ("*", "*", "/any"),
            ("10.0.0.1", "*", "/host"),
            ("*", "80", "/port"),
            ("10.0.0.1", "80", "/exact"),
        ]);
        let target = at(10, 0, 0, 1, 80);
        assert_eq!(full.lookup(&target), Some("/exact"));

        let mut without_exact = full.clone();
        without_exact.targets.remove(&EndpointKey::new("10.0.0.1", "80"));
        assert_eq!(without_exact.lookup(&target), Some("/port"));

        let mut host_and_any = without_exact.clone();
        host_and_any.targets.remove(&EndpointKey::new("*", "80"));
        assert_eq!(host_and_any.lookup(&target), Some("/host"));

        let mut any_only = host_and_any.clone();
        any_only.targets.remove(&EndpointKey::new("10.0.0.1", "*"));
        assert_eq!(any_only.lookup(&target), Some("/any"));

        any_only.targets.remove(&EndpointKey::new("*", "*"));
        assert_eq!(any_only.lookup(&target), None);
    }

    #[test]
    fn miss_without_catch_all() {
        let table = table(&[("10.0.0.1", "80", "/a")]);
        assert_eq!(table.lookup(&at(10, 0, 0, 1, 81)), None);
        assert_eq!(table.lookup(&at(10, 0, 0, 2, 80)), None);
        assert!(RuleTable::new().lookup(&at(10, 0, 0, 1, 80)).is_none());
    }

    #[test]
    fn later_insert_overwrites_but_keeps_position() {
        let mut table = table(&[("*", "80", "/first"), ("*", "81", "/other")]);
        let replaced = table.insert(EndpointKey::new("*", "80"), "/second".into());
        assert_eq!(replaced.as_deref(), Some("/first"));
        assert_eq!(table.len(), 2);
        let entries: Vec<(String, &str)> =
            table.iter().map(|(k, v)| (k.to_string(), v)).collect();
        assert_eq!(
            entries,
            [("*:80".to_string(), "/second"), ("*:81".to_string(), "/other")]
        );
    }
}
