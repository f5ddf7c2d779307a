//! Unix socket capture feed.
//!
//! The external capture helper connects to `capture_socket`. Both directions
//! carry newline-delimited JSON: the helper reads [`ControlMessage`]s telling
//! it which interfaces to hook, and writes one [`RawEvent`] per line back.
//!
//! On connect the helper first receives an `attach` for every interface that
//! is currently attached. An attach may be repeated; helpers treat it as
//! idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flowkeeper_common::RawEvent;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream, unix::OwnedWriteHalf},
    sync::broadcast::{self, error::RecvError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    capture::{Capture, CaptureError, CaptureOptions},
    iface::InterfaceInfo,
    metrics::registry::FLOW_EVENTS_TOTAL,
    pipeline::Ingest,
};

const CONTROL_BACKLOG: usize = 256;
/// Longest event line accepted from a helper, newline excluded.
pub const MAX_EVENT_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlMessage {
    Attach {
        if_index: u32,
        if_name: String,
        options: CaptureOptions,
    },
    Detach {
        if_index: u32,
        if_name: String,
    },
}

#[derive(Debug, Clone)]
struct Attachment {
    name: String,
    options: CaptureOptions,
}

/// [`Capture`] implementation backed by connected helper processes.
///
/// Only events for attached interfaces are admitted; anything else is counted
/// as `unknown_interface` and dropped.
#[derive(Debug, Clone)]
pub struct SocketCapture {
    attached: Arc<DashMap<u32, Attachment>>,
    control_tx: broadcast::Sender<ControlMessage>,
}

impl Default for SocketCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketCapture {
    pub fn new() -> Self {
        let (control_tx, _) = broadcast::channel(CONTROL_BACKLOG);
        Self {
            attached: Arc::new(DashMap::new()),
            control_tx,
        }
    }

    pub fn is_attached(&self, if_index: u32) -> bool {
        self.attached.contains_key(&if_index)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    fn snapshot(&self) -> Vec<ControlMessage> {
        let mut messages: Vec<ControlMessage> = self
            .attached
            .iter()
            .map(|entry| ControlMessage::Attach {
                if_index: *entry.key(),
                if_name: entry.value().name.clone(),
                options: entry.value().options,
            })
            .collect();
        messages.sort_by_key(|msg| match msg {
            ControlMessage::Attach { if_index, .. } | ControlMessage::Detach { if_index, .. } => {
                *if_index
            }
        });
        messages
    }

    /// Accepts helper connections until shutdown, then drops them all.
    pub async fn serve(
        self,
        listener: UnixListener,
        ingest: Ingest,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut connections = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_id += 1;
                        info!(
                            event.name = "capture.helper_connected",
                            connection_id = next_id,
                            "capture helper connected"
                        );
                        let conn = Connection {
                            id: next_id,
                            capture: self.clone(),
                            control_rx: self.control_tx.subscribe(),
                            ingest: ingest.clone(),
                        };
                        connections.spawn(conn.run(stream));
                    }
                    Err(e) => {
                        error!(
                            event.name = "capture.accept_failed",
                            error.message = %e,
                            "failed to accept capture helper connection"
                        );
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let open = connections.len();
        connections.shutdown().await;
        info!(
            event.name = "capture.socket_closed",
            dropped_connections = open,
            "capture socket closed"
        );
    }
}

#[async_trait]
impl Capture for SocketCapture {
    async fn attach(
        &self,
        iface: &InterfaceInfo,
        opts: &CaptureOptions,
    ) -> Result<(), CaptureError> {
        if self.attached.contains_key(&iface.index) {
            return Err(CaptureError::AlreadyAttached(iface.to_string()));
        }
        self.attached.insert(
            iface.index,
            Attachment {
                name: iface.name.clone(),
                options: *opts,
            },
        );
        // no helper connected yet: it gets the snapshot on connect
        let _ = self.control_tx.send(ControlMessage::Attach {
            if_index: iface.index,
            if_name: iface.name.clone(),
            options: *opts,
        });
        Ok(())
    }

    async fn detach(&self, iface: &InterfaceInfo) -> Result<(), CaptureError> {
        if self.attached.remove(&iface.index).is_none() {
            return Err(CaptureError::NotAttached(iface.to_string()));
        }
        let _ = self.control_tx.send(ControlMessage::Detach {
            if_index: iface.index,
            if_name: iface.name.clone(),
        });
        Ok(())
    }
}

struct Connection {
    id: u64,
    capture: SocketCapture,
    control_rx: broadcast::Receiver<ControlMessage>,
    ingest: Ingest,
}

impl Connection {
    async fn run(mut self, stream: UnixStream) {
        let (read, mut write) = stream.into_split();
        let mut lines = LineReader::new(read, MAX_EVENT_LINE);

        if let Err(e) = send_control(&mut write, &self.capture.snapshot()).await {
            self.closed(Some(e));
            return;
        }

        let reason = loop {
            tokio::select! {
                frame = lines.next() => match frame {
                    Ok(Some(Frame::Line(line))) => self.handle_line(&line),
                    Ok(Some(bad)) => self.reject(&bad),
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                },
                msg = self.control_rx.recv() => {
                    let sent = match msg {
                        Ok(msg) => send_control(&mut write, std::slice::from_ref(&msg)).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(
                                event.name = "capture.control_lagged",
                                connection_id = self.id,
                                missed,
                                "capture helper fell behind on control messages, resending attachments"
                            );
                            // skip the stale backlog, the snapshot supersedes it
                            self.control_rx = self.control_rx.resubscribe();
                            send_control(&mut write, &self.capture.snapshot()).await
                        }
                        Err(RecvError::Closed) => break None,
                    };
                    if let Err(e) = sent {
                        break Some(e);
                    }
                }
            }
        };
        self.closed(reason);
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event: RawEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                FLOW_EVENTS_TOTAL.with_label_values(&["decode_error"]).inc();
                debug!(
                    event.name = "capture.decode_failed",
                    connection_id = self.id,
                    error.message = %e,
                    "discarding undecodable capture event"
                );
                return;
            }
        };
        if !self.capture.is_attached(event.key.if_index) {
            FLOW_EVENTS_TOTAL
                .with_label_values(&["unknown_interface"])
                .inc();
            return;
        }
        self.ingest.offer(event);
    }

    fn reject(&self, frame: &Frame) {
        FLOW_EVENTS_TOTAL.with_label_values(&["decode_error"]).inc();
        debug!(
            event.name = "capture.decode_failed",
            connection_id = self.id,
            reason = frame.as_str(),
            "discarding unreadable capture line"
        );
    }

    fn closed(&self, error: Option<std::io::Error>) {
        match error {
            Some(e) => warn!(
                event.name = "capture.helper_disconnected",
                connection_id = self.id,
                error.message = %e,
                "capture helper connection failed"
            ),
            None => info!(
                event.name = "capture.helper_disconnected",
                connection_id = self.id,
                "capture helper disconnected"
            ),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    Oversized,
    NotUtf8,
}

impl Frame {
    fn as_str(&self) -> &'static str {
        match self {
            Frame::Line(_) => "line",
            Frame::Oversized => "oversized",
            Frame::NotUtf8 => "not_utf8",
        }
    }
}

/// Newline-delimited reader that never holds more than `max` bytes of a line.
///
/// An oversized line is skipped up to its newline and reported once. Only
/// `fill_buf` is awaited, so `next` can be raced in `select!` without losing
/// bytes.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(read: R, max: usize) -> Self {
        Self {
            inner: BufReader::new(read),
            buf: Vec::new(),
            max,
            discarding: false,
        }
    }

    async fn next(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if std::mem::take(&mut self.discarding) {
                    return Ok(Some(Frame::Oversized));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let used = chunk.len() + usize::from(newline.is_some());
            if !self.discarding {
                if self.buf.len() + chunk.len() > self.max {
                    self.discarding = true;
                    self.buf = Vec::new();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
            }
            self.inner.consume(used);

            if newline.is_some() {
                if std::mem::take(&mut self.discarding) {
                    return Ok(Some(Frame::Oversized));
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> Frame {
        match String::from_utf8(std::mem::take(&mut self.buf)) {
            Ok(line) => Frame::Line(line),
            Err(_) => Frame::NotUtf8,
        }
    }
}

async fn send_control(
    write: &mut OwnedWriteHalf,
    messages: &[ControlMessage],
) -> Result<(), std::io::Error> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    for msg in messages {
        serde_json::to_writer(&mut buf, msg)?;
        buf.push(b'\n');
    }
    write.write_all(&buf).await?;
    write.flush().await
}
