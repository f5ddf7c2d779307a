use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    iface::{
        lister::InterfaceLister,
        netlink_monitor::{self, LinkEvent},
        selector::InterfaceSelector,
        types::{IfaceEvent, InterfaceInfo},
    },
    metrics::registry::IFACE_EVENTS_TOTAL,
    runtime::conf::ListenMode,
};

/// Produces `Added`/`Removed` events for selected interfaces.
///
/// Both modes work the same way: re-enumerate, keep the interfaces that are up
/// and selected, and diff against what was reported before. Watch mode
/// re-enumerates on every kernel link notification, poll mode on a timer.
pub struct InterfaceSource {
    lister: Arc<dyn InterfaceLister>,
    selector: Arc<InterfaceSelector>,
    mode: ListenMode,
    poll_period: Duration,
    known: BTreeMap<u32, InterfaceInfo>,
}

impl InterfaceSource {
    pub fn new(
        lister: Arc<dyn InterfaceLister>,
        selector: Arc<InterfaceSelector>,
        mode: ListenMode,
        poll_period: Duration,
    ) -> Self {
        Self {
            lister,
            selector,
            mode,
            poll_period,
            known: BTreeMap::new(),
        }
    }

    /// Interfaces reported as added and not yet removed.
    pub fn known(&self) -> impl Iterator<Item = &InterfaceInfo> {
        self.known.values()
    }

    /// Re-enumerates and returns the changes since the last call, removals first.
    pub fn reconcile(&mut self) -> Vec<IfaceEvent> {
        let current: BTreeMap<u32, InterfaceInfo> = self
            .lister
            .list()
            .into_iter()
            .filter(|iface| iface.up && self.selector.selects(iface))
            .map(|iface| (iface.index, iface))
            .collect();

        let mut events = Vec::new();

        let gone: Vec<u32> = self
            .known
            .iter()
            .filter(|(index, old)| {
                current
                    .get(index)
                    .is_none_or(|new| new.name != old.name)
            })
            .map(|(index, _)| *index)
            .collect();
        for index in gone {
            if let Some(old) = self.known.remove(&index) {
                events.push(IfaceEvent::Removed(old));
            }
        }

        for (index, iface) in current {
            if !self.known.contains_key(&index) {
                self.known.insert(index, iface.clone());
                events.push(IfaceEvent::Added(iface));
            }
        }

        for event in &events {
            IFACE_EVENTS_TOTAL.with_label_values(&[event.kind()]).inc();
        }

        events
    }

    /// Runs until shutdown or until the event receiver goes away.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<IfaceEvent>,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        match self.mode {
            ListenMode::Poll => self.poll(event_tx, shutdown_rx).await,
            ListenMode::Watch => {
                let (link_tx, link_rx) = mpsc::unbounded_channel();
                match netlink_monitor::spawn_netlink_thread(link_tx) {
                    Ok(_handle) => self.watch(link_rx, event_tx, shutdown_rx).await,
                    Err(e) => {
                        warn!(
                            event.name = "interface_source.watch_unavailable",
                            error = %e,
                            poll_period_ms = self.poll_period.as_millis() as u64,
                            "cannot watch link notifications, falling back to polling"
                        );
                        self.poll(event_tx, shutdown_rx).await
                    }
                }
            }
        }
    }

    /// Re-enumerates on every link notification received on `link_rx`.
    pub async fn watch(
        mut self,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        event_tx: mpsc::UnboundedSender<IfaceEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(
            event.name = "interface_source.started",
            mode = "watch",
            "interface source started"
        );

        if !self.emit(&event_tx) {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                link = link_rx.recv() => {
                    let Some(link) = link else {
                        warn!(
                            event.name = "interface_source.watch_stopped",
                            poll_period_ms = self.poll_period.as_millis() as u64,
                            "link notification thread exited, falling back to polling"
                        );
                        return self.poll(event_tx, shutdown_rx).await;
                    };
                    debug!(
                        event.name = "interface_source.link_event",
                        link = ?link,
                        "link notification received"
                    );
                    if !self.emit(&event_tx) {
                        return;
                    }
                }
            }
        }

        info!(
            event.name = "interface_source.stopped",
            known_interfaces = self.known.len(),
            "interface source stopped"
        );
    }

    /// Re-enumerates every `poll_period`.
    pub async fn poll(
        mut self,
        event_tx: mpsc::UnboundedSender<IfaceEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!(
            event.name = "interface_source.started",
            mode = "poll",
            poll_period_ms = self.poll_period.as_millis() as u64,
            "interface source started"
        );

        let mut ticker = tokio::time::interval(self.poll_period);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if !self.emit(&event_tx) {
                        return;
                    }
                }
            }
        }

        info!(
            event.name = "interface_source.stopped",
            known_interfaces = self.known.len(),
            "interface source stopped"
        );
    }

    fn emit(&mut self, event_tx: &mpsc::UnboundedSender<IfaceEvent>) -> bool {
        for event in self.reconcile() {
            debug!(
                event.name = "interface_source.event",
                network.interface.name = %event.info().name,
                network.interface.index = event.info().index,
                kind = event.kind(),
                "interface lifecycle event"
            );
            if event_tx.send(event).is_err() {
                return false;
            }
        }
        true
    }
}
