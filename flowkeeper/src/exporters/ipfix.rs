//! IPFIX (RFC 7011) export over UDP or TCP.
//!
//! Two fixed templates are used: 256 for IPv4 flows and 257 for IPv6 flows. A
//! flow with one IPv4 and one IPv6 address goes out as IPv6 with the IPv4
//! address mapped. Both templates end with the exporter (agent) address, one
//! field per family; the family not in use is zero.

use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket, lookup_host},
};
use tracing::{debug, info, warn};

use crate::{
    cache::AccountedFlow,
    exporters::{ExportBatch, ExportError, FlowExporter},
};

pub const IPFIX_VERSION: u16 = 10;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const IPV4_TEMPLATE_ID: u16 = 256;
pub const IPV6_TEMPLATE_ID: u16 = 257;

/// Largest UDP message, kept under a typical path MTU.
pub const UDP_MAX_MESSAGE_BYTES: usize = 1400;
/// TCP has no datagram limit; this only bounds the size of one write.
const TCP_MAX_MESSAGE_BYTES: usize = 65_535;

const MESSAGE_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// (information element id, length)
type FieldSpec = (u16, u16);

const IPV4_FIELDS: &[FieldSpec] = &[
    (8, 4),   // sourceIPv4Address
    (12, 4),  // destinationIPv4Address
    (7, 2),   // sourceTransportPort
    (11, 2),  // destinationTransportPort
    (4, 1),   // protocolIdentifier
    (1, 8),   // octetDeltaCount
    (2, 8),   // packetDeltaCount
    (152, 8), // flowStartMilliseconds
    (153, 8), // flowEndMilliseconds
    (10, 4),  // ingressInterface
    (61, 1),  // flowDirection
    (6, 2),   // tcpControlBits
    (32, 2),  // icmpTypeCodeIPv4
    (130, 4), // exporterIPv4Address
    (131, 16), // exporterIPv6Address
];

const IPV6_FIELDS: &[FieldSpec] = &[
    (27, 16), // sourceIPv6Address
    (28, 16), // destinationIPv6Address
    (7, 2),
    (11, 2),
    (4, 1),
    (1, 8),
    (2, 8),
    (152, 8),
    (153, 8),
    (10, 4),
    (61, 1),
    (6, 2),
    (139, 2), // icmpTypeCodeIPv6
    (130, 4),
    (131, 16),
];

const fn record_len(fields: &[FieldSpec]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < fields.len() {
        total += fields[i].1 as usize;
        i += 1;
    }
    total
}

pub const IPV4_RECORD_LEN: usize = record_len(IPV4_FIELDS);
pub const IPV6_RECORD_LEN: usize = record_len(IPV6_FIELDS);

fn template_set_len() -> usize {
    SET_HEADER_LEN + (4 + IPV4_FIELDS.len() * 4) + (4 + IPV6_FIELDS.len() * 4)
}

/// Builds IPFIX messages and tracks the per-domain sequence number.
#[derive(Debug)]
pub struct IpfixEncoder {
    observation_domain: u32,
    sequence: u32,
    max_message_bytes: usize,
}

struct MessageBuilder {
    buf: BytesMut,
    open_set: Option<(u16, usize)>,
    records: u32,
}

impl IpfixEncoder {
    pub fn new(observation_domain: u32, max_message_bytes: usize) -> Self {
        Self {
            observation_domain,
            sequence: 0,
            max_message_bytes: max_message_bytes.max(
                MESSAGE_HEADER_LEN + template_set_len() + SET_HEADER_LEN + IPV6_RECORD_LEN,
            ),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Encodes `flows` into as many messages as the size limit requires.
    ///
    /// With `templates_in_every_message` each message starts with the template
    /// set; otherwise only the first one does when `send_templates` is set.
    pub fn encode(
        &mut self,
        flows: &[AccountedFlow],
        send_templates: bool,
        templates_in_every_message: bool,
        export_time: u32,
    ) -> Vec<BytesMut> {
        let mut messages = Vec::new();
        let mut with_templates = send_templates || templates_in_every_message;
        let mut msg = self.start_message(with_templates);

        for flow in flows {
            let v6 = flow.key.is_ipv6();
            let (template_id, len) = if v6 {
                (IPV6_TEMPLATE_ID, IPV6_RECORD_LEN)
            } else {
                (IPV4_TEMPLATE_ID, IPV4_RECORD_LEN)
            };
            let set_overhead = match msg.open_set {
                Some((id, _)) if id == template_id => 0,
                _ => SET_HEADER_LEN,
            };

            if msg.records > 0 && msg.buf.len() + set_overhead + len > self.max_message_bytes {
                messages.push(self.finish_message(msg, export_time));
                with_templates = templates_in_every_message;
                msg = self.start_message(with_templates);
            }

            if msg.open_set.is_none_or(|(id, _)| id != template_id) {
                close_set(&mut msg);
                let start = msg.buf.len();
                msg.buf.put_u16(template_id);
                msg.buf.put_u16(0);
                msg.open_set = Some((template_id, start));
            }
            write_record(&mut msg.buf, flow, v6);
            msg.records += 1;
        }

        if msg.records > 0 {
            messages.push(self.finish_message(msg, export_time));
        } else if send_templates && messages.is_empty() {
            // templates alone, e.g. right after a tcp connect with nothing to send
            messages.push(self.finish_message(msg, export_time));
        }
        messages
    }

    fn start_message(&self, with_templates: bool) -> MessageBuilder {
        let mut buf = BytesMut::with_capacity(self.max_message_bytes);
        buf.put_bytes(0, MESSAGE_HEADER_LEN);
        if with_templates {
            write_template_set(&mut buf);
        }
        MessageBuilder {
            buf,
            open_set: None,
            records: 0,
        }
    }

    fn finish_message(&mut self, mut msg: MessageBuilder, export_time: u32) -> BytesMut {
        close_set(&mut msg);
        let len = msg.buf.len() as u16;
        let header = &mut msg.buf[..MESSAGE_HEADER_LEN];
        header[0..2].copy_from_slice(&IPFIX_VERSION.to_be_bytes());
        header[2..4].copy_from_slice(&len.to_be_bytes());
        header[4..8].copy_from_slice(&export_time.to_be_bytes());
        header[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        header[12..16].copy_from_slice(&self.observation_domain.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(msg.records);
        msg.buf
    }
}

fn close_set(msg: &mut MessageBuilder) {
    if let Some((_, start)) = msg.open_set.take() {
        let len = (msg.buf.len() - start) as u16;
        msg.buf[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

fn write_template_set(buf: &mut BytesMut) {
    buf.put_u16(TEMPLATE_SET_ID);
    buf.put_u16(template_set_len() as u16);
    for (id, fields) in [(IPV4_TEMPLATE_ID, IPV4_FIELDS), (IPV6_TEMPLATE_ID, IPV6_FIELDS)] {
        buf.put_u16(id);
        buf.put_u16(fields.len() as u16);
        for (element, len) in fields {
            buf.put_u16(*element);
            buf.put_u16(*len);
        }
    }
}

fn v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn write_record(buf: &mut BytesMut, flow: &AccountedFlow, as_v6: bool) {
    let key = &flow.key;
    match (as_v6, key.src_addr, key.dst_addr) {
        (false, IpAddr::V4(src), IpAddr::V4(dst)) => {
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
        }
        _ => {
            buf.put_slice(&v6(key.src_addr).octets());
            buf.put_slice(&v6(key.dst_addr).octets());
        }
    }
    buf.put_u16(key.src_port);
    buf.put_u16(key.dst_port);
    buf.put_u8(key.protocol);
    buf.put_u64(flow.bytes);
    buf.put_u64(flow.packets);
    buf.put_u64(flow.first_seen_ns / 1_000_000);
    buf.put_u64(flow.last_seen_ns / 1_000_000);
    buf.put_u32(key.if_index);
    buf.put_u8(key.direction.as_u8());
    // tcpControlBits carries the header bits only
    buf.put_u16(flow.tcp_flags & 0x00ff);
    buf.put_u8(flow.icmp_type);
    buf.put_u8(flow.icmp_code);
    match flow.agent_ip {
        Some(IpAddr::V4(agent)) => {
            buf.put_slice(&agent.octets());
            buf.put_bytes(0, 16);
        }
        Some(IpAddr::V6(agent)) => {
            buf.put_bytes(0, 4);
            buf.put_slice(&agent.octets());
        }
        None => buf.put_bytes(0, 20),
    }
}

fn export_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

async fn resolve(target: &str) -> Result<SocketAddr, ExportError> {
    lookup_host(target)
        .await
        .map_err(|source| ExportError::Connect {
            target: target.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ExportError::Connect {
            target: target.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
        })
}

/// IPFIX over UDP. Every datagram is self-describing.
pub struct IpfixUdpExporter {
    socket: UdpSocket,
    encoder: IpfixEncoder,
}

impl IpfixUdpExporter {
    pub async fn connect(target: &str) -> Result<Self, ExportError> {
        let peer = resolve(target).await?;
        let local: SocketAddr = if peer.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            ([0, 0, 0, 0], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket
            .connect(peer)
            .await
            .map_err(|source| ExportError::Connect {
                target: target.to_string(),
                source,
            })?;

        info!(
            event.name = "exporter.ipfix.configured",
            transport = "udp",
            peer = %peer,
            "ipfix exporter configured"
        );
        Ok(Self {
            socket,
            encoder: IpfixEncoder::new(0, UDP_MAX_MESSAGE_BYTES),
        })
    }
}

#[async_trait]
impl FlowExporter for IpfixUdpExporter {
    fn name(&self) -> &'static str {
        "ipfix+udp"
    }

    async fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        let messages = self
            .encoder
            .encode(&batch.records, true, true, export_time());
        for message in &messages {
            self.socket.send(message).await?;
        }
        debug!(
            event.name = "exporter.ipfix.sent",
            transport = "udp",
            messages = messages.len(),
            records = batch.len(),
            "sent ipfix messages"
        );
        Ok(())
    }
}

/// IPFIX over TCP. Templates are sent once per connection; a write error drops
/// the connection and the next batch reconnects.
pub struct IpfixTcpExporter {
    target: String,
    stream: Option<TcpStream>,
    encoder: IpfixEncoder,
}

impl IpfixTcpExporter {
    pub fn new(target: String) -> Self {
        info!(
            event.name = "exporter.ipfix.configured",
            transport = "tcp",
            peer = %target,
            "ipfix exporter configured"
        );
        Self {
            target,
            stream: None,
            encoder: IpfixEncoder::new(0, TCP_MAX_MESSAGE_BYTES),
        }
    }

    async fn connect(&self) -> Result<TcpStream, ExportError> {
        let peer = resolve(&self.target).await?;
        let connect_error = |source| ExportError::Connect {
            target: self.target.clone(),
            source,
        };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| {
                connect_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(connect_error)?;
        info!(
            event.name = "exporter.ipfix.connected",
            peer = %peer,
            "connected to ipfix collector"
        );
        Ok(stream)
    }
}

#[async_trait]
impl FlowExporter for IpfixTcpExporter {
    fn name(&self) -> &'static str {
        "ipfix+tcp"
    }

    async fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        let fresh = self.stream.is_none();
        if fresh {
            self.stream = Some(self.connect().await?);
        }
        let messages = self
            .encoder
            .encode(&batch.records, fresh, false, export_time());

        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        for message in &messages {
            if let Err(e) = stream.write_all(message).await {
                warn!(
                    event.name = "exporter.ipfix.connection_lost",
                    error = %e,
                    "ipfix connection lost, reconnecting on next batch"
                );
                self.stream = None;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ExportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}
