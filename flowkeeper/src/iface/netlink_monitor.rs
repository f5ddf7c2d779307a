//! Kernel link notifications over an `NETLINK_ROUTE` socket.
//!
//! The socket is read on a dedicated OS thread with a blocking `recv`; parsed
//! events are forwarded to the async side through an unbounded channel. The
//! thread exits on the first message received after the channel is closed, or on
//! a socket error.

use std::{io, thread};

use netlink_packet_core::{NetlinkBuffer, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkFlags, LinkMessage},
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// RTMGRP_LINK multicast group bitmask.
const RTMGRP_LINK: u32 = 0x0000_0001;

const NETLINK_RECV_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// RTM_NEWLINK or RTM_SETLINK with IFF_UP set.
    Up { index: u32, name: String },
    /// RTM_NEWLINK/RTM_SETLINK without IFF_UP, or RTM_DELLINK.
    Down { index: u32, name: String },
}

/// Opens and subscribes the netlink socket, then spawns the reader thread.
///
/// Socket errors surface here so the caller can fall back to polling.
pub fn spawn_netlink_thread(
    event_tx: mpsc::UnboundedSender<LinkEvent>,
) -> io::Result<thread::JoinHandle<()>> {
    let mut socket = Socket::new(NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, RTMGRP_LINK))?;

    info!(
        event.name = "interface_source.netlink.subscribed",
        "subscribed to link notifications"
    );

    thread::Builder::new()
        .name("flowkeeper-netlink".to_string())
        .spawn(move || run(socket, event_tx))
}

fn run(socket: Socket, event_tx: mpsc::UnboundedSender<LinkEvent>) {
    let mut buf: Vec<u8> = Vec::with_capacity(NETLINK_RECV_BUFFER_SIZE);
    let mut total_skipped = 0u64;

    loop {
        buf.clear();
        let n = match socket.recv(&mut buf, 0) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(
                    event.name = "interface_source.netlink.recv_error",
                    error = %e,
                    "error receiving from netlink socket, exiting"
                );
                return;
            }
        };

        if n == 0 {
            warn!(
                event.name = "interface_source.netlink.socket_closed",
                "netlink socket closed by kernel, exiting"
            );
            return;
        }

        trace!(
            event.name = "interface_source.netlink.data_received",
            bytes = n,
            "received netlink data"
        );

        let (events, skipped) = parse_link_events(&buf[..n.min(buf.len())]);
        if skipped > 0 {
            total_skipped += skipped;
            warn!(
                event.name = "interface_source.netlink.messages_skipped",
                skipped_in_batch = skipped,
                total_skipped,
                "skipped unparseable netlink messages"
            );
        }

        for event in events {
            if event_tx.send(event).is_err() {
                debug!(
                    event.name = "interface_source.netlink.stopped",
                    "link event receiver closed, exiting"
                );
                return;
            }
        }
    }
}

/// Parses every message in one datagram. Returns the link events and the number
/// of messages that could not be parsed (parsing stops at the first bad one).
pub fn parse_link_events(bytes: &[u8]) -> (Vec<LinkEvent>, u64) {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let remaining = &bytes[offset..];
        let msg_len = match NetlinkBuffer::new_checked(remaining) {
            Ok(nl_buf) => nl_buf.length() as usize,
            Err(_) => break,
        };

        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(remaining) {
            Ok(msg) => msg,
            Err(_) => return (events, 1),
        };

        // NLMSG_ALIGN
        let aligned = (msg_len + 3) & !3;
        if aligned == 0 {
            return (events, 1);
        }
        offset = offset.saturating_add(aligned);

        if let NetlinkPayload::InnerMessage(inner) = msg.payload {
            match inner {
                RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::SetLink(link) => {
                    if let Some(name) = link_name(&link) {
                        let index = link.header.index;
                        if link.header.flags.contains(LinkFlags::Up) {
                            events.push(LinkEvent::Up { index, name });
                        } else {
                            events.push(LinkEvent::Down { index, name });
                        }
                    }
                }
                RouteNetlinkMessage::DelLink(link) => {
                    if let Some(name) = link_name(&link) {
                        events.push(LinkEvent::Down {
                            index: link.header.index,
                            name,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    (events, 0)
}

fn link_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: RouteNetlinkMessage) -> Vec<u8> {
        let mut msg = NetlinkMessage::from(message);
        msg.finalize();
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);
        buf
    }

    fn link(index: u32, name: &str, up: bool) -> LinkMessage {
        let mut link = LinkMessage::default();
        link.header.index = index;
        if up {
            link.header.flags = LinkFlags::Up;
        }
        link.attributes.push(LinkAttribute::IfName(name.to_string()));
        link
    }

    #[test]
    fn parses_new_and_deleted_links_in_one_datagram() {
        let mut datagram = encode(RouteNetlinkMessage::NewLink(link(3, "veth0", true)));
        datagram.extend(encode(RouteNetlinkMessage::NewLink(link(4, "veth1", false))));
        datagram.extend(encode(RouteNetlinkMessage::DelLink(link(3, "veth0", false))));

        let (events, skipped) = parse_link_events(&datagram);
        assert_eq!(skipped, 0);
        assert_eq!(
            events,
            vec![
                LinkEvent::Up {
                    index: 3,
                    name: "veth0".to_string()
                },
                LinkEvent::Down {
                    index: 4,
                    name: "veth1".to_string()
                },
                LinkEvent::Down {
                    index: 3,
                    name: "veth0".to_string()
                },
            ]
        );
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let mut datagram = encode(RouteNetlinkMessage::NewLink(link(7, "eth7", true)));
        datagram.extend_from_slice(&[0x10, 0x00]);

        let (events, skipped) = parse_link_events(&datagram);
        assert_eq!(events.len(), 1);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn empty_datagram_yields_nothing() {
        assert_eq!(parse_link_events(&[]), (Vec::new(), 0));
    }
}
