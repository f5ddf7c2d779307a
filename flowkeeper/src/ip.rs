//! IP network parsing shared by the interface selector and the flow filter.

use std::net::IpAddr;

use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;

/// Parses a CIDR (`10.0.0.0/8`) or a bare address (`10.0.0.1`, treated as a host route).
///
/// Host bits set in a CIDR are truncated, so `10.1.2.3/8` is the same as `10.0.0.0/8`.
pub fn parse_network(input: &str) -> Result<IpNetwork, Error> {
    let input = input.trim();
    match input.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr
                .parse()
                .map_err(|_| Error::InvalidNetwork(input.to_string()))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| Error::InvalidNetwork(input.to_string()))?;
            IpNetwork::new_truncate(addr, prefix).map_err(|_| Error::InvalidNetwork(input.to_string()))
        }
        None => input
            .parse::<IpAddr>()
            .map(IpNetwork::from)
            .map_err(|_| Error::InvalidNetwork(input.to_string())),
    }
}

/// Builds a lookup table from a list of CIDRs. Fails on the first invalid entry.
pub fn build_network_table<S: AsRef<str>>(list: &[S]) -> Result<IpNetworkTable<()>, Error> {
    let mut table = IpNetworkTable::new();
    for item in list {
        let item = item.as_ref().trim();
        if item.is_empty() {
            continue;
        }
        table.insert(parse_network(item)?, ());
    }
    Ok(table)
}

pub fn table_contains(table: &IpNetworkTable<()>, addr: IpAddr) -> bool {
    table.longest_match(addr).is_some()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidNetwork(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidNetwork(input) => write!(f, "invalid cidr or ip address '{input}'"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn parses_cidr_and_bare_address() {
        let net = parse_network("10.0.0.0/8").expect("valid cidr");
        assert!(net.contains(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7))));

        let host = parse_network("192.168.1.10").expect("valid address");
        assert!(host.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))));
        assert!(!host.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 11))));
    }

    #[test]
    fn truncates_host_bits() {
        let net = parse_network("10.1.2.3/8").expect("host bits are truncated");
        assert_eq!(net, parse_network("10.0.0.0/8").expect("valid cidr"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            parse_network("10.0.0.0/40"),
            Err(Error::InvalidNetwork("10.0.0.0/40".to_string()))
        );
        assert!(parse_network("not-an-ip").is_err());
    }

    #[test]
    fn table_matches_both_families() {
        let table = build_network_table(&["10.0.0.0/8", "fd00::/8", " "]).expect("valid table");
        assert!(table_contains(&table, IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))));
        assert!(table_contains(
            &table,
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1))
        ));
        assert!(!table_contains(&table, IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
    }
}
