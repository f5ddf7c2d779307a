//! The address every exported flow is stamped with.
//!
//! Resolved once at startup: an explicit `agent_ip` wins, otherwise the address
//! is picked according to `agent_ip_iface` and `agent_ip_type`.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::iface::lister::InterfaceLister;

/// Public resolvers used only to pick a route; no packet is sent to them.
const PROBE_V4: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 80);
const PROBE_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    80,
);

/// Where the agent address comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentIpIface {
    /// Source address of the default outbound route.
    #[default]
    External,
    /// First non-loopback address of any interface.
    Local,
    /// First address of the named interface (`name:eth0`).
    Name(String),
}

impl FromStr for AgentIpIface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "external" => Ok(AgentIpIface::External),
            "local" => Ok(AgentIpIface::Local),
            other => match other.strip_prefix("name:") {
                Some(name) if !name.is_empty() => Ok(AgentIpIface::Name(name.to_string())),
                _ => Err(format!(
                    "unknown agent_ip_iface '{other}', expected external, local or name:<interface>"
                )),
            },
        }
    }
}

impl TryFrom<String> for AgentIpIface {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentIpIface> for String {
    fn from(value: AgentIpIface) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AgentIpIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentIpIface::External => f.write_str("external"),
            AgentIpIface::Local => f.write_str("local"),
            AgentIpIface::Name(name) => write!(f, "name:{name}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentIpType {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AgentIpType {
    pub fn accepts(&self, addr: &IpAddr) -> bool {
        match self {
            AgentIpType::Any => true,
            AgentIpType::Ipv4 => addr.is_ipv4(),
            AgentIpType::Ipv6 => addr.is_ipv6(),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AgentIpType::Any => "any",
            AgentIpType::Ipv4 => "ipv4",
            AgentIpType::Ipv6 => "ipv6",
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentIpError {
    #[error("no {ip_type} address found on {source_desc}")]
    NoAddress {
        source_desc: String,
        ip_type: &'static str,
    },

    #[error("cannot determine the outbound address: {0}")]
    Probe(#[source] std::io::Error),
}

/// Resolves the agent address, using the routing table for `external`.
pub fn resolve(
    explicit: Option<IpAddr>,
    iface: &AgentIpIface,
    ip_type: AgentIpType,
    lister: &dyn InterfaceLister,
) -> Result<IpAddr, AgentIpError> {
    resolve_with(explicit, iface, ip_type, lister, outbound_addr)
}

/// Like [`resolve`], with the outbound route lookup supplied by the caller.
pub fn resolve_with<P>(
    explicit: Option<IpAddr>,
    iface: &AgentIpIface,
    ip_type: AgentIpType,
    lister: &dyn InterfaceLister,
    probe: P,
) -> Result<IpAddr, AgentIpError>
where
    P: Fn(SocketAddr) -> std::io::Result<IpAddr>,
{
    if let Some(addr) = explicit {
        return Ok(addr);
    }

    let addr = match iface {
        AgentIpIface::External => from_route(ip_type, probe)?,
        AgentIpIface::Local => lister
            .list()
            .into_iter()
            .flat_map(|i| i.addrs)
            .find(|addr| !addr.is_loopback() && ip_type.accepts(addr))
            .ok_or_else(|| AgentIpError::NoAddress {
                source_desc: "any non-loopback interface".to_string(),
                ip_type: ip_type.as_str(),
            })?,
        AgentIpIface::Name(name) => lister
            .list()
            .into_iter()
            .filter(|i| &i.name == name)
            .flat_map(|i| i.addrs)
            .find(|addr| ip_type.accepts(addr))
            .ok_or_else(|| AgentIpError::NoAddress {
                source_desc: format!("interface '{name}'"),
                ip_type: ip_type.as_str(),
            })?,
    };

    info!(
        event.name = "agent_ip.resolved",
        agent.ip = %addr,
        agent.ip_iface = %iface,
        agent.ip_type = ip_type.as_str(),
        "resolved agent address"
    );
    Ok(addr)
}

fn from_route<P>(ip_type: AgentIpType, probe: P) -> Result<IpAddr, AgentIpError>
where
    P: Fn(SocketAddr) -> std::io::Result<IpAddr>,
{
    match ip_type {
        AgentIpType::Ipv4 => probe(PROBE_V4).map_err(AgentIpError::Probe),
        AgentIpType::Ipv6 => probe(PROBE_V6).map_err(AgentIpError::Probe),
        AgentIpType::Any => probe(PROBE_V4)
            .or_else(|_| probe(PROBE_V6))
            .map_err(AgentIpError::Probe),
    }
}

/// Local address the kernel would use to reach `target`. Connecting a UDP
/// socket only selects a route.
pub fn outbound_addr(target: SocketAddr) -> std::io::Result<IpAddr> {
    let bind: SocketAddr = if target.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::iface::{lister::StaticLister, types::InterfaceInfo};

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7));
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7));

    fn lister() -> StaticLister {
        StaticLister::new(vec![
            InterfaceInfo::new(1, "lo").with_addrs([IpAddr::V4(Ipv4Addr::LOCALHOST)]),
            InterfaceInfo::new(2, "eth0").with_addrs([V6, V4]),
            InterfaceInfo::new(3, "eth1")
                .with_addrs([IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))]),
        ])
    }

    fn unreachable(_: SocketAddr) -> io::Result<IpAddr> {
        Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "no route"))
    }

    #[test]
    fn explicit_address_wins() {
        let explicit = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
        let addr = resolve_with(
            Some(explicit),
            &AgentIpIface::Name("missing".to_string()),
            AgentIpType::Ipv6,
            &lister(),
            unreachable,
        )
        .expect("explicit address needs no lookup");
        assert_eq!(addr, explicit);
    }

    #[test]
    fn external_uses_the_route_of_the_requested_family() {
        let probe = |target: SocketAddr| -> io::Result<IpAddr> {
            if target.is_ipv4() {
                Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "no v4 route"))
            } else {
                Ok(V6)
            }
        };
        let any = resolve_with(None, &AgentIpIface::External, AgentIpType::Any, &lister(), probe);
        assert_eq!(any.expect("falls back to v6"), V6);

        let v4 = resolve_with(None, &AgentIpIface::External, AgentIpType::Ipv4, &lister(), probe);
        assert!(matches!(v4, Err(AgentIpError::Probe(_))));
    }

    #[test]
    fn local_skips_loopback_and_honours_the_type() {
        let l = lister();
        let any = resolve_with(None, &AgentIpIface::Local, AgentIpType::Any, &l, unreachable);
        assert_eq!(any.expect("eth0 address"), V6);

        let v4 = resolve_with(None, &AgentIpIface::Local, AgentIpType::Ipv4, &l, unreachable);
        assert_eq!(v4.expect("eth0 v4 address"), V4);

        let only_lo = StaticLister::new(vec![
            InterfaceInfo::new(1, "lo").with_addrs([IpAddr::V4(Ipv4Addr::LOCALHOST)]),
        ]);
        let none = resolve_with(None, &AgentIpIface::Local, AgentIpType::Any, &only_lo, unreachable);
        assert!(matches!(none, Err(AgentIpError::NoAddress { .. })));
    }

    #[test]
    fn named_interface_address() {
        let l = lister();
        let eth1 = AgentIpIface::Name("eth1".to_string());
        let addr = resolve_with(None, &eth1, AgentIpType::Any, &l, unreachable);
        assert_eq!(addr.expect("eth1 address"), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));

        let v6 = resolve_with(None, &eth1, AgentIpType::Ipv6, &l, unreachable);
        assert!(matches!(v6, Err(AgentIpError::NoAddress { .. })));

        let lo = AgentIpIface::Name("lo".to_string());
        let addr = resolve_with(None, &lo, AgentIpType::Any, &l, unreachable);
        assert_eq!(addr.expect("loopback allowed by name"), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn outbound_addr_to_loopback_is_loopback() {
        let target: SocketAddr = (Ipv4Addr::LOCALHOST, 9).into();
        assert_eq!(
            outbound_addr(target).expect("loopback route exists"),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn iface_option_parses_and_prints() {
        assert_eq!("external".parse(), Ok(AgentIpIface::External));
        assert_eq!(" local ".parse(), Ok(AgentIpIface::Local));
        assert_eq!(
            "name:br-ex".parse(),
            Ok(AgentIpIface::Name("br-ex".to_string()))
        );
        assert!("name:".parse::<AgentIpIface>().is_err());
        assert!("eth0".parse::<AgentIpIface>().is_err());
        assert_eq!(AgentIpIface::Name("eth0".to_string()).to_string(), "name:eth0");
    }
}
