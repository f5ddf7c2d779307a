use flowkeeper_common::Direction;
use serde::{Deserialize, Serialize};

/// What to do with an event that matched a rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    #[default]
    Accept,
    Reject,
}

/// One declarative filter rule as written in the configuration file.
///
/// Every populated field must match for the rule to apply. Port selectors come
/// in three flavours per side: a single port, an inclusive range (`"8000-8010"`)
/// and a pair of ports (`"53,5353"`). At most one flavour may be set per side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowFilterRule {
    pub direction: Option<Direction>,
    /// CIDR matched against the source or destination address.
    pub ip_cidr: Option<String>,
    /// Protocol name: TCP, UDP, SCTP, ICMP or ICMPv6.
    pub protocol: Option<String>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    /// Matches either the source or the destination port.
    pub port: Option<u16>,
    pub source_port_range: Option<String>,
    pub destination_port_range: Option<String>,
    pub port_range: Option<String>,
    pub source_ports: Option<String>,
    pub destination_ports: Option<String>,
    pub ports: Option<String>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    /// The address on the other end of the flow from the one matched by `ip_cidr`.
    pub peer_ip: Option<String>,
    /// One of SYN, SYN-ACK, ACK, FIN, RST, PSH, URG, ECE, CWR, FIN-ACK, RST-ACK.
    pub tcp_flags: Option<String>,
    /// Only match events carrying drop information.
    pub drops: bool,
    pub action: FilterAction,
    /// Admit one of every `sample` matching events. 0 and 1 admit everything.
    pub sample: u32,
}
