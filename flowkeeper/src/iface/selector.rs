//! Which interfaces the agent captures on.
//!
//! Name lists hold exact names or `/regex/` entries. A non-empty `interface_ips`
//! list replaces name matching entirely: an interface is selected when one of its
//! addresses falls in one of the CIDRs.

use ip_network_table::IpNetworkTable;
use regex::Regex;
use thiserror::Error;

use crate::{iface::types::InterfaceInfo, ip};

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid interface regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid interface_ips entry: {0}")]
    InvalidCidr(#[from] ip::Error),
}

#[derive(Debug, Clone)]
enum NameMatcher {
    Exact(String),
    Regex(Regex),
}

impl NameMatcher {
    fn parse(entry: &str) -> Result<Self, SelectorError> {
        let entry = entry.trim();
        match entry
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) if entry.len() >= 2 => Regex::new(pattern)
                .map(NameMatcher::Regex)
                .map_err(|source| SelectorError::InvalidRegex {
                    pattern: pattern.to_string(),
                    source,
                }),
            _ => Ok(NameMatcher::Exact(entry.to_string())),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Exact(exact) => exact == name,
            NameMatcher::Regex(re) => re.is_match(name),
        }
    }
}

pub struct InterfaceSelector {
    include: Vec<NameMatcher>,
    exclude: Vec<NameMatcher>,
    networks: Option<IpNetworkTable<()>>,
}

impl InterfaceSelector {
    pub fn new<S: AsRef<str>>(
        include: &[S],
        exclude: &[S],
        interface_ips: &[S],
    ) -> Result<Self, SelectorError> {
        let parse_all = |list: &[S]| {
            list.iter()
                .map(|s| s.as_ref())
                .filter(|s| !s.trim().is_empty())
                .map(NameMatcher::parse)
                .collect::<Result<Vec<_>, _>>()
        };

        let networks = if interface_ips.iter().any(|s| !s.as_ref().trim().is_empty()) {
            Some(ip::build_network_table(interface_ips)?)
        } else {
            None
        };

        Ok(Self {
            include: parse_all(include)?,
            exclude: parse_all(exclude)?,
            networks,
        })
    }

    /// Whether selection is done by address rather than by name.
    pub fn by_address(&self) -> bool {
        self.networks.is_some()
    }

    pub fn selects(&self, iface: &InterfaceInfo) -> bool {
        if let Some(table) = &self.networks {
            return iface
                .addrs
                .iter()
                .any(|addr| ip::table_contains(table, *addr));
        }

        if self.exclude.iter().any(|m| m.matches(&iface.name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|m| m.matches(&iface.name))
    }
}

impl std::fmt::Debug for InterfaceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceSelector")
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("by_address", &self.by_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    const NONE: &[&str] = &[];

    fn iface(name: &str) -> InterfaceInfo {
        InterfaceInfo::new(1, name)
    }

    #[test]
    fn empty_include_selects_everything_not_excluded() {
        let selector = InterfaceSelector::new(NONE, &["lo"], NONE).expect("valid selector");
        assert!(selector.selects(&iface("eth0")));
        assert!(selector.selects(&iface("veth1234")));
        assert!(!selector.selects(&iface("lo")));
    }

    #[test]
    fn exact_names_are_case_sensitive_and_whole() {
        let selector = InterfaceSelector::new(&["eth0"], NONE, NONE).expect("valid selector");
        assert!(selector.selects(&iface("eth0")));
        assert!(!selector.selects(&iface("ETH0")));
        assert!(!selector.selects(&iface("eth01")));
    }

    #[test]
    fn slash_enclosed_entries_are_regexes() {
        let selector =
            InterfaceSelector::new(&["/^veth/", "eth0"], &["/-tmp$/"], NONE).expect("valid selector");
        assert!(selector.selects(&iface("veth9f3a")));
        assert!(selector.selects(&iface("eth0")));
        assert!(!selector.selects(&iface("veth9f3a-tmp")));
        assert!(!selector.selects(&iface("br0")));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let selector = InterfaceSelector::new(&["/^eth/"], &["eth1"], NONE).expect("valid selector");
        assert!(selector.selects(&iface("eth0")));
        assert!(!selector.selects(&iface("eth1")));
    }

    #[test]
    fn lone_slash_is_an_exact_name() {
        let selector = InterfaceSelector::new(&["/"], NONE, NONE).expect("valid selector");
        assert!(selector.selects(&iface("/")));
    }

    #[test]
    fn interface_ips_replace_name_matching() {
        let selector = InterfaceSelector::new(&["eth0"], &["eth1"], &["10.0.0.0/24"])
            .expect("valid selector");
        assert!(selector.by_address());

        let in_range = iface("eth1").with_addrs([IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);
        let out_of_range = iface("eth0").with_addrs([IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7))]);
        assert!(selector.selects(&in_range));
        assert!(!selector.selects(&out_of_range));
        assert!(!selector.selects(&iface("eth0")));
    }

    #[test]
    fn invalid_regex_and_cidr_are_errors() {
        assert!(matches!(
            InterfaceSelector::new(&["/([/"], NONE, NONE),
            Err(SelectorError::InvalidRegex { .. })
        ));
        assert!(matches!(
            InterfaceSelector::new(NONE, NONE, &["10.0.0.0/33"]),
            Err(SelectorError::InvalidCidr(_))
        ));
    }
}
