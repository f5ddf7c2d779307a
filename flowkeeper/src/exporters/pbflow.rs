//! Protobuf flow records shared by the gRPC and Kafka backends.
//!
//! Package `pbflow`. The gRPC backend sends one [`Records`] per call, the Kafka
//! backend one encoded [`Record`] per message.

use std::net::IpAddr;

use flowkeeper_common::{Direction, InterfacePair};

use crate::cache::AccountedFlow;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FlowDirection {
    Ingress = 0,
    Egress = 1,
}

impl From<Direction> for FlowDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Ingress => FlowDirection::Ingress,
            Direction::Egress => FlowDirection::Egress,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Records {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<Record>,
}

/// Response of `pbflow.Collector/Send`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CollectorReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Record {
    #[prost(enumeration = "FlowDirection", tag = "1")]
    pub direction: i32,
    #[prost(uint64, tag = "2")]
    pub time_flow_start_ns: u64,
    #[prost(uint64, tag = "3")]
    pub time_flow_end_ns: u64,
    #[prost(message, optional, tag = "5")]
    pub network: Option<Network>,
    #[prost(message, optional, tag = "6")]
    pub transport: Option<Transport>,
    #[prost(uint64, tag = "7")]
    pub bytes: u64,
    #[prost(uint64, tag = "8")]
    pub packets: u64,
    #[prost(string, tag = "9")]
    pub interface: String,
    #[prost(bool, tag = "10")]
    pub duplicate: bool,
    #[prost(uint32, tag = "11")]
    pub if_index: u32,
    #[prost(uint32, tag = "12")]
    pub flags: u32,
    #[prost(uint32, tag = "13")]
    pub icmp_type: u32,
    #[prost(uint32, tag = "14")]
    pub icmp_code: u32,
    #[prost(uint64, tag = "15")]
    pub pkt_drop_bytes: u64,
    #[prost(uint64, tag = "16")]
    pub pkt_drop_packets: u64,
    #[prost(uint32, tag = "17")]
    pub pkt_drop_latest_flags: u32,
    #[prost(uint32, tag = "18")]
    pub pkt_drop_latest_drop_cause: u32,
    #[prost(message, optional, tag = "19")]
    pub agent_ip: Option<Ip>,
    #[prost(uint32, tag = "20")]
    pub dns_id: u32,
    #[prost(uint32, tag = "21")]
    pub dns_flags: u32,
    #[prost(uint64, tag = "22")]
    pub dns_latency_ns: u64,
    #[prost(uint32, tag = "23")]
    pub dns_errno: u32,
    #[prost(uint64, tag = "24")]
    pub time_flow_rtt_ns: u64,
    #[prost(message, repeated, tag = "25")]
    pub dup_list: Vec<DupMapEntry>,
    #[prost(message, optional, tag = "26")]
    pub xlat: Option<Xlat>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ip {
    #[prost(oneof = "ip::IpFamily", tags = "1, 2")]
    pub ip_family: Option<ip::IpFamily>,
}

pub mod ip {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum IpFamily {
        #[prost(fixed32, tag = "1")]
        Ipv4(u32),
        #[prost(bytes, tag = "2")]
        Ipv6(Vec<u8>),
    }
}

impl From<IpAddr> for Ip {
    fn from(addr: IpAddr) -> Self {
        let family = match addr {
            IpAddr::V4(v4) => ip::IpFamily::Ipv4(u32::from(v4)),
            IpAddr::V6(v6) => ip::IpFamily::Ipv6(v6.octets().to_vec()),
        };
        Self {
            ip_family: Some(family),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Network {
    #[prost(message, optional, tag = "1")]
    pub src_addr: Option<Ip>,
    #[prost(message, optional, tag = "2")]
    pub dst_addr: Option<Ip>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Transport {
    #[prost(uint32, tag = "1")]
    pub src_port: u32,
    #[prost(uint32, tag = "2")]
    pub dst_port: u32,
    #[prost(uint32, tag = "3")]
    pub protocol: u32,
}

/// One interface/direction the flow was observed on.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DupMapEntry {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(enumeration = "FlowDirection", tag = "2")]
    pub direction: i32,
    #[prost(uint32, tag = "3")]
    pub if_index: u32,
}

impl From<&InterfacePair> for DupMapEntry {
    fn from(pair: &InterfacePair) -> Self {
        Self {
            interface: pair.if_name.clone(),
            direction: FlowDirection::from(pair.direction) as i32,
            if_index: pair.if_index,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Xlat {
    #[prost(message, optional, tag = "1")]
    pub src_addr: Option<Ip>,
    #[prost(message, optional, tag = "2")]
    pub dst_addr: Option<Ip>,
    #[prost(uint32, tag = "3")]
    pub src_port: u32,
    #[prost(uint32, tag = "4")]
    pub dst_port: u32,
    #[prost(uint32, tag = "5")]
    pub zone_id: u32,
}

impl From<&AccountedFlow> for Record {
    fn from(flow: &AccountedFlow) -> Self {
        let key = &flow.key;
        let drops = flow.drops.unwrap_or_default();
        let dns = flow.dns.unwrap_or_default();

        Self {
            direction: FlowDirection::from(key.direction) as i32,
            time_flow_start_ns: flow.first_seen_ns,
            time_flow_end_ns: flow.last_seen_ns,
            network: Some(Network {
                src_addr: Some(key.src_addr.into()),
                dst_addr: Some(key.dst_addr.into()),
            }),
            transport: Some(Transport {
                src_port: u32::from(key.src_port),
                dst_port: u32::from(key.dst_port),
                protocol: u32::from(key.protocol),
            }),
            bytes: flow.bytes,
            packets: flow.packets,
            interface: flow.if_name.clone(),
            duplicate: flow.duplicate,
            if_index: key.if_index,
            flags: u32::from(flow.tcp_flags),
            icmp_type: u32::from(flow.icmp_type),
            icmp_code: u32::from(flow.icmp_code),
            pkt_drop_bytes: drops.bytes,
            pkt_drop_packets: drops.packets,
            pkt_drop_latest_flags: u32::from(drops.latest_tcp_flags),
            pkt_drop_latest_drop_cause: drops.latest_cause,
            agent_ip: flow.agent_ip.map(Ip::from),
            dns_id: u32::from(dns.id),
            dns_flags: u32::from(dns.flags),
            dns_latency_ns: dns.latency_ns,
            dns_errno: u32::from(dns.errno),
            time_flow_rtt_ns: flow.rtt_ns.unwrap_or(0),
            dup_list: flow.interfaces.iter().map(DupMapEntry::from).collect(),
            xlat: flow.translation.map(|t| Xlat {
                src_addr: Some(t.src_addr.into()),
                dst_addr: Some(t.dst_addr.into()),
                src_port: u32::from(t.src_port),
                dst_port: u32::from(t.dst_port),
                zone_id: u32::from(t.zone_id),
            }),
        }
    }
}

impl Records {
    pub fn from_flows(flows: &[AccountedFlow]) -> Self {
        Self {
            entries: flows.iter().map(Record::from).collect(),
        }
    }
}
