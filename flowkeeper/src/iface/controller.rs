//! Applies interface lifecycle events to the capture.
//!
//! ```text
//! InterfaceSource ──IfaceEvent──► IfaceController ──attach/detach──► Capture
//! ```
//!
//! Attach failures are logged and counted, never fatal: the interface simply
//! stays uncaptured until it is removed and reported again. On shutdown every
//! attached interface is detached.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    capture::{Capture, CaptureOptions},
    iface::types::{IfaceEvent, InterfaceInfo},
    metrics::registry::{IFACE_ATTACHED, IFACE_CAPTURE_OPS_TOTAL},
};

pub struct IfaceController {
    capture: Arc<dyn Capture>,
    options: CaptureOptions,
    active: BTreeMap<u32, InterfaceInfo>,
}

impl IfaceController {
    pub fn new(capture: Arc<dyn Capture>, options: CaptureOptions) -> Self {
        info!(
            event.name = "interface_controller.created",
            ingress = options.ingress,
            egress = options.egress,
            "interface controller created"
        );
        Self {
            capture,
            options,
            active: BTreeMap::new(),
        }
    }

    /// Interfaces with capture currently attached.
    pub fn active(&self) -> impl Iterator<Item = &InterfaceInfo> {
        self.active.values()
    }

    pub async fn handle(&mut self, event: IfaceEvent) {
        match event {
            IfaceEvent::Added(iface) => self.add(iface).await,
            IfaceEvent::Removed(iface) => self.remove(iface).await,
        }
    }

    async fn add(&mut self, iface: InterfaceInfo) {
        if self.active.contains_key(&iface.index) {
            debug!(
                event.name = "interface_controller.already_attached",
                network.interface.name = %iface.name,
                network.interface.index = iface.index,
                "interface already attached, ignoring"
            );
            return;
        }

        info!(
            event.name = "interface_controller.interface_added",
            network.interface.name = %iface.name,
            network.interface.index = iface.index,
            "detected new interface, attaching capture"
        );

        match self.capture.attach(&iface, &self.options).await {
            Ok(()) => {
                record("attach", "ok");
                self.active.insert(iface.index, iface);
                IFACE_ATTACHED.set(self.active.len() as i64);
            }
            Err(e) => {
                record("attach", "error");
                error!(
                    event.name = "interface_controller.attach_failed",
                    network.interface.name = %iface.name,
                    network.interface.index = iface.index,
                    error.message = %e,
                    "failed to attach capture to interface, skipping"
                );
            }
        }
    }

    async fn remove(&mut self, iface: InterfaceInfo) {
        let Some(attached) = self.active.remove(&iface.index) else {
            debug!(
                event.name = "interface_controller.removal_ignored",
                network.interface.name = %iface.name,
                "interface was never attached"
            );
            return;
        };
        IFACE_ATTACHED.set(self.active.len() as i64);

        info!(
            event.name = "interface_controller.interface_removed",
            network.interface.name = %attached.name,
            network.interface.index = attached.index,
            "detected interface removal, detaching capture"
        );
        self.detach(&attached).await;
    }

    async fn detach(&self, iface: &InterfaceInfo) -> bool {
        match self.capture.detach(iface).await {
            Ok(()) => {
                record("detach", "ok");
                debug!(
                    event.name = "interface_controller.capture_detached",
                    network.interface.name = %iface.name,
                    "capture detached"
                );
                true
            }
            Err(e) => {
                record("detach", "error");
                warn!(
                    event.name = "interface_controller.detach_failed",
                    network.interface.name = %iface.name,
                    error.message = %e,
                    "failed to detach capture"
                );
                false
            }
        }
    }

    /// Applies events until the source goes away or shutdown is signalled,
    /// then detaches everything.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<IfaceEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        let total = self.active.len();
        info!(
            event.name = "interface_controller.shutdown_started",
            attached = total,
            "starting graceful shutdown and capture detachment"
        );

        let mut failed_count = 0;
        for iface in std::mem::take(&mut self.active).into_values() {
            if !self.detach(&iface).await {
                failed_count += 1;
            }
        }
        IFACE_ATTACHED.set(0);

        info!(
            event.name = "interface_controller.shutdown_completed",
            attached = total,
            failed_count,
            "controller shutdown completed"
        );
    }
}

fn record(operation: &str, status: &str) {
    IFACE_CAPTURE_OPS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::testing::RecordingCapture,
        runtime::conf::Conf,
    };

    fn controller(capture: Arc<RecordingCapture>) -> IfaceController {
        IfaceController::new(capture, CaptureOptions::from_conf(&Conf::default()))
    }

    #[tokio::test]
    async fn added_and_removed_interfaces_drive_capture() {
        let capture = Arc::new(RecordingCapture::default());
        let mut controller = controller(Arc::clone(&capture));

        controller
            .handle(IfaceEvent::Added(InterfaceInfo::new(2, "eth0")))
            .await;
        controller
            .handle(IfaceEvent::Added(InterfaceInfo::new(2, "eth0")))
            .await;
        controller
            .handle(IfaceEvent::Removed(InterfaceInfo::new(7, "veth7")))
            .await;
        controller
            .handle(IfaceEvent::Removed(InterfaceInfo::new(2, "eth0")))
            .await;

        assert_eq!(
            capture.calls(),
            vec![("attach", "eth0".to_string()), ("detach", "eth0".to_string())]
        );
        assert_eq!(controller.active().count(), 0);
    }

    #[tokio::test]
    async fn attach_failure_is_skipped() {
        let capture = Arc::new(RecordingCapture {
            refuse: vec!["bad0".to_string()],
            ..Default::default()
        });
        let mut controller = controller(Arc::clone(&capture));

        controller
            .handle(IfaceEvent::Added(InterfaceInfo::new(3, "bad0")))
            .await;
        controller
            .handle(IfaceEvent::Added(InterfaceInfo::new(4, "eth1")))
            .await;

        let active: Vec<_> = controller.active().map(|i| i.name.clone()).collect();
        assert_eq!(active, vec!["eth1".to_string()]);

        // removing the interface that never attached must not detach it
        controller
            .handle(IfaceEvent::Removed(InterfaceInfo::new(3, "bad0")))
            .await;
        assert_eq!(capture.calls().len(), 2);
    }

    #[tokio::test]
    async fn run_detaches_everything_on_shutdown() {
        let capture = Arc::new(RecordingCapture::default());
        let controller = controller(Arc::clone(&capture));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        events_tx
            .send(IfaceEvent::Added(InterfaceInfo::new(2, "eth0")))
            .expect("controller receiving");
        events_tx
            .send(IfaceEvent::Added(InterfaceInfo::new(3, "eth1")))
            .expect("controller receiving");

        let task = tokio::spawn(controller.run(events_rx, shutdown_rx));
        while capture.calls().len() < 2 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).expect("controller listening");
        task.await.expect("controller exits");

        let detached: Vec<_> = capture
            .calls()
            .into_iter()
            .filter(|(op, _)| *op == "detach")
            .map(|(_, name)| name)
            .collect();
        assert_eq!(detached, vec!["eth0".to_string(), "eth1".to_string()]);
    }
}
