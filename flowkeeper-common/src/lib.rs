//! Plain data types shared between the capture helper and the flowkeeper agent.
//!
//! The capture side produces [`RawEvent`]s; the agent consumes them. Everything in
//! here is a value type with no behaviour beyond key derivation, so both sides can
//! depend on it without pulling in the agent's runtime stack.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// IANA protocol numbers the agent knows by name.
pub mod proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
    pub const SCTP: u8 = 132;
}

/// TCP flag bits as reported by the capture side.
///
/// The low byte mirrors the TCP header. The upper bits are synthesized by the
/// capture program when it sees a combined flag in a single segment.
pub mod tcp_flags {
    pub const FIN: u16 = 0x01;
    pub const SYN: u16 = 0x02;
    pub const RST: u16 = 0x04;
    pub const PSH: u16 = 0x08;
    pub const ACK: u16 = 0x10;
    pub const URG: u16 = 0x20;
    pub const ECE: u16 = 0x40;
    pub const CWR: u16 = 0x80;
    pub const SYN_ACK: u16 = 0x100;
    pub const FIN_ACK: u16 = 0x200;
    pub const RST_ACK: u16 = 0x400;
}

/// Packet direction relative to the interface it was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// Wire value used by the flow export formats (0 = ingress, 1 = egress).
    pub const fn as_u8(&self) -> u8 {
        match self {
            Direction::Ingress => 0,
            Direction::Egress => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 5-tuple part of a [`FlowKey`], used to spot the same flow on several interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BaseKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Identity of a unidirectional flow as seen on one interface in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub if_index: u32,
    pub direction: Direction,
}

impl FlowKey {
    pub fn base(&self) -> BaseKey {
        BaseKey {
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            src_port: self.src_port,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
    }

    /// Returns the same 5-tuple re-homed on another interface and direction.
    pub fn with_interface(self, if_index: u32, direction: Direction) -> Self {
        Self {
            if_index,
            direction,
            ..self
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.src_addr.is_ipv6() || self.dst_addr.is_ipv6()
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            if_index: 0,
            direction: Direction::Ingress,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto={} if={} {}",
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            self.protocol,
            self.if_index,
            self.direction
        )
    }
}

/// An interface and the direction a flow was observed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InterfacePair {
    pub if_index: u32,
    pub if_name: String,
    pub direction: Direction,
}

/// Kernel drop information attached to an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DropInfo {
    pub packets: u32,
    pub bytes: u64,
    pub cause: u32,
    pub latest_tcp_flags: u16,
}

/// DNS transaction metadata tracked on the capture side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DnsInfo {
    pub id: u16,
    pub flags: u16,
    pub latency_ns: u64,
    pub errno: u8,
}

/// Address translation (NAT) seen for the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Translation {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub zone_id: u16,
}

/// Optional per-event fields. Which ones are populated depends on the features
/// enabled on the capture side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EventFlags {
    pub tcp_flags: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub drops: Option<DropInfo>,
    pub rtt_ns: Option<u64>,
    pub dns: Option<DnsInfo>,
    pub translation: Option<Translation>,
}

/// One observation delivered by the capture side.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEvent {
    pub key: FlowKey,
    pub if_name: String,
    /// Capture time in nanoseconds since the unix epoch.
    pub timestamp_ns: u64,
    pub bytes: u64,
    pub packets: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub flags: EventFlags,
}

impl RawEvent {
    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.timestamp_ns)
    }

    /// The interface and direction this event was captured on.
    pub fn observed_pair(&self) -> InterfacePair {
        InterfacePair {
            if_index: self.key.if_index,
            if_name: self.if_name.clone(),
            direction: self.key.direction,
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.flags.rtt_ns.map(Duration::from_nanos)
    }
}
