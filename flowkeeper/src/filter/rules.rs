//! Compiled flow filter rules.
//!
//! Rules are evaluated in order and the first one that matches decides the
//! outcome. Sampling counters are owned by the rule, so a rule with `sample: N`
//! admits exactly one of every N events it matches, independent of the flow key.

use std::{net::IpAddr, ops::RangeInclusive};

use flowkeeper_common::{Direction, FlowKey, RawEvent, proto, tcp_flags};
use ip_network_table::IpNetworkTable;
use thiserror::Error;

use crate::{
    filter::{
        opts::{FilterAction, FlowFilterRule},
        sampling::EveryNth,
    },
    ip,
};

/// Outcome of evaluating an event against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    /// Matched an accepting rule but lost the sampling draw.
    SampledOut,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("flow filter rule {rule}: {source}")]
    InvalidNetwork {
        rule: usize,
        #[source]
        source: ip::Error,
    },

    #[error("flow filter rule {rule}: invalid peer ip '{value}'")]
    InvalidPeerIp { rule: usize, value: String },

    #[error("flow filter rule {rule}: unknown protocol '{value}'")]
    UnknownProtocol { rule: usize, value: String },

    #[error("flow filter rule {rule}: invalid port range '{value}', expected 'start-end'")]
    InvalidPortRange { rule: usize, value: String },

    #[error("flow filter rule {rule}: invalid port pair '{value}', expected 'port1,port2'")]
    InvalidPortPair { rule: usize, value: String },

    #[error("flow filter rule {rule}: unknown tcp flags '{value}'")]
    UnknownTcpFlags { rule: usize, value: String },

    #[error("flow filter rule {rule}: only one of {field}, {field}_range and {field}s may be set")]
    ConflictingPorts { rule: usize, field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortMatch {
    Exact(u16),
    Range(RangeInclusive<u16>),
    Pair(u16, u16),
}

impl PortMatch {
    fn matches(&self, port: u16) -> bool {
        match self {
            PortMatch::Exact(p) => *p == port,
            PortMatch::Range(range) => range.contains(&port),
            PortMatch::Pair(a, b) => *a == port || *b == port,
        }
    }

    fn compile(
        rule: usize,
        field: &'static str,
        exact: Option<u16>,
        range: Option<&str>,
        pair: Option<&str>,
    ) -> Result<Option<Self>, FilterError> {
        let set = [exact.is_some(), range.is_some(), pair.is_some()];
        if set.iter().filter(|s| **s).count() > 1 {
            return Err(FilterError::ConflictingPorts { rule, field });
        }

        if let Some(port) = exact {
            return Ok(Some(PortMatch::Exact(port)));
        }

        if let Some(value) = range {
            let invalid = || FilterError::InvalidPortRange {
                rule,
                value: value.to_string(),
            };
            let (start, end) = value.split_once('-').ok_or_else(invalid)?;
            let start: u16 = start.trim().parse().map_err(|_| invalid())?;
            let end: u16 = end.trim().parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            return Ok(Some(PortMatch::Range(start..=end)));
        }

        if let Some(value) = pair {
            let invalid = || FilterError::InvalidPortPair {
                rule,
                value: value.to_string(),
            };
            let (a, b) = value.split_once(',').ok_or_else(invalid)?;
            let a: u16 = a.trim().parse().map_err(|_| invalid())?;
            let b: u16 = b.trim().parse().map_err(|_| invalid())?;
            return Ok(Some(PortMatch::Pair(a, b)));
        }

        Ok(None)
    }
}

fn parse_protocol(rule: usize, value: &str) -> Result<u8, FilterError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TCP" => Ok(proto::TCP),
        "UDP" => Ok(proto::UDP),
        "SCTP" => Ok(proto::SCTP),
        "ICMP" => Ok(proto::ICMP),
        "ICMPV6" => Ok(proto::ICMPV6),
        _ => Err(FilterError::UnknownProtocol {
            rule,
            value: value.to_string(),
        }),
    }
}

fn parse_tcp_flags(rule: usize, value: &str) -> Result<u16, FilterError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "SYN" => Ok(tcp_flags::SYN),
        "SYN-ACK" => Ok(tcp_flags::SYN_ACK),
        "ACK" => Ok(tcp_flags::ACK),
        "FIN" => Ok(tcp_flags::FIN),
        "RST" => Ok(tcp_flags::RST),
        "PSH" => Ok(tcp_flags::PSH),
        "URG" => Ok(tcp_flags::URG),
        "ECE" => Ok(tcp_flags::ECE),
        "CWR" => Ok(tcp_flags::CWR),
        "FIN-ACK" => Ok(tcp_flags::FIN_ACK),
        "RST-ACK" => Ok(tcp_flags::RST_ACK),
        _ => Err(FilterError::UnknownTcpFlags {
            rule,
            value: value.to_string(),
        }),
    }
}

struct CompiledRule {
    direction: Option<Direction>,
    networks: Option<IpNetworkTable<()>>,
    peer_ip: Option<IpAddr>,
    protocol: Option<u8>,
    source_port: Option<PortMatch>,
    destination_port: Option<PortMatch>,
    any_port: Option<PortMatch>,
    icmp_type: Option<u8>,
    icmp_code: Option<u8>,
    tcp_flags: Option<u16>,
    drops: bool,
    action: FilterAction,
    sampler: EveryNth,
}

impl CompiledRule {
    fn compile(index: usize, rule: &FlowFilterRule) -> Result<Self, FilterError> {
        let networks = rule
            .ip_cidr
            .as_deref()
            .map(|cidr| {
                ip::build_network_table(&[cidr])
                    .map_err(|source| FilterError::InvalidNetwork { rule: index, source })
            })
            .transpose()?;

        let peer_ip = rule
            .peer_ip
            .as_deref()
            .map(|value| {
                value
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| FilterError::InvalidPeerIp {
                        rule: index,
                        value: value.to_string(),
                    })
            })
            .transpose()?;

        Ok(Self {
            direction: rule.direction,
            networks,
            peer_ip,
            protocol: rule
                .protocol
                .as_deref()
                .map(|p| parse_protocol(index, p))
                .transpose()?,
            source_port: PortMatch::compile(
                index,
                "source_port",
                rule.source_port,
                rule.source_port_range.as_deref(),
                rule.source_ports.as_deref(),
            )?,
            destination_port: PortMatch::compile(
                index,
                "destination_port",
                rule.destination_port,
                rule.destination_port_range.as_deref(),
                rule.destination_ports.as_deref(),
            )?,
            any_port: PortMatch::compile(
                index,
                "port",
                rule.port,
                rule.port_range.as_deref(),
                rule.ports.as_deref(),
            )?,
            icmp_type: rule.icmp_type,
            icmp_code: rule.icmp_code,
            tcp_flags: rule
                .tcp_flags
                .as_deref()
                .map(|f| parse_tcp_flags(index, f))
                .transpose()?,
            drops: rule.drops,
            action: rule.action,
            sampler: EveryNth::new(rule.sample),
        })
    }

    fn matches_addresses(&self, key: &FlowKey) -> bool {
        let peer_ok = |other: IpAddr| self.peer_ip.is_none_or(|peer| peer == other);
        match &self.networks {
            Some(table) => {
                (ip::table_contains(table, key.src_addr) && peer_ok(key.dst_addr))
                    || (ip::table_contains(table, key.dst_addr) && peer_ok(key.src_addr))
            }
            None => match self.peer_ip {
                Some(peer) => key.src_addr == peer || key.dst_addr == peer,
                None => true,
            },
        }
    }

    fn matches(&self, event: &RawEvent) -> bool {
        let key = &event.key;
        let flags = &event.flags;

        if self.direction.is_some_and(|d| d != key.direction) {
            return false;
        }
        if self.protocol.is_some_and(|p| p != key.protocol) {
            return false;
        }
        if !self.matches_addresses(key) {
            return false;
        }
        if let Some(m) = &self.source_port
            && !m.matches(key.src_port)
        {
            return false;
        }
        if let Some(m) = &self.destination_port
            && !m.matches(key.dst_port)
        {
            return false;
        }
        if let Some(m) = &self.any_port
            && !(m.matches(key.src_port) || m.matches(key.dst_port))
        {
            return false;
        }
        if self.icmp_type.is_some_and(|t| t != flags.icmp_type) {
            return false;
        }
        if self.icmp_code.is_some_and(|c| c != flags.icmp_code) {
            return false;
        }
        if self.tcp_flags.is_some_and(|f| flags.tcp_flags & f != f) {
            return false;
        }
        if self.drops && flags.drops.is_none() {
            return false;
        }
        true
    }
}

/// Ordered, compiled rule set. Safe to share between capture feeds.
pub struct FlowFilter {
    rules: Vec<CompiledRule>,
    default_action: FilterAction,
}

impl std::fmt::Debug for FlowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowFilter")
            .field("rules", &self.rules.len())
            .field("default_action", &self.default_action)
            .finish()
    }
}

impl FlowFilter {
    pub fn new(rules: &[FlowFilterRule], default_action: FilterAction) -> Result<Self, FilterError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule::compile(index, rule))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            default_action,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, event: &RawEvent) -> Verdict {
        let Some(rule) = self.rules.iter().find(|rule| rule.matches(event)) else {
            return match self.default_action {
                FilterAction::Accept => Verdict::Accept,
                FilterAction::Reject => Verdict::Reject,
            };
        };

        match rule.action {
            FilterAction::Reject => Verdict::Reject,
            FilterAction::Accept if rule.sampler.admit() => Verdict::Accept,
            FilterAction::Accept => Verdict::SampledOut,
        }
    }
}
