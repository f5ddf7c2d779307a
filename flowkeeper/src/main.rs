use std::{path::Path, sync::Arc};

use flowkeeper::{
    FlowkeeperError,
    capture::{CaptureOptions, socket::SocketCapture},
    exporters::{ExportBatch, build_exporter},
    iface::{controller::IfaceController, lister::SystemLister, source::InterfaceSource},
    metrics::registry::{FLOW_EVENTS_TOTAL, counter_value, init_registry},
    pipeline::Pipeline,
    runtime::{Runtime, init_tracing, task_manager::TaskManager},
};
use tokio::{
    net::UnixListener,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = Runtime::new()?;
    let conf = Arc::clone(&runtime.conf);
    init_tracing(conf.log_level);
    runtime.log_notices();
    init_registry().map_err(FlowkeeperError::from)?;

    let agent_ip = conf
        .resolve_agent_ip(&SystemLister)
        .map_err(FlowkeeperError::from)?;
    let built = build_exporter(&conf).await.map_err(FlowkeeperError::from)?;
    let mut tasks = TaskManager::new();

    if let Some(rx) = built.direct_rx {
        tasks.spawn("direct-consumer", log_batches(rx));
    }

    let pipeline = Pipeline::start(&conf, built.exporter, agent_ip, &mut tasks)?;

    let listener = bind_capture_socket(&conf.capture_socket)?;
    let capture = SocketCapture::new();
    let ingest = pipeline.ingest();
    let serving = capture.clone();
    tasks.spawn_with_shutdown("capture-socket", move |shutdown_rx| {
        serving.serve(listener, ingest, shutdown_rx)
    });

    let (iface_tx, iface_rx) = mpsc::unbounded_channel();
    let source = InterfaceSource::new(
        Arc::new(SystemLister),
        Arc::new(conf.selector()?),
        conf.listen_interfaces,
        conf.listen_poll_period,
    );
    tasks.spawn_with_shutdown("interface-source", move |shutdown_rx| {
        source.run(iface_tx, shutdown_rx)
    });

    let controller = IfaceController::new(Arc::new(capture), CaptureOptions::from_conf(&conf));
    tasks.spawn_with_shutdown("interface-controller", move |shutdown_rx| {
        controller.run(iface_rx, shutdown_rx)
    });

    info!(
        event.name = "system.started",
        capture_socket = %conf.capture_socket.display(),
        exporter = %conf.export,
        agent.ip = %agent_ip,
        "flowkeeper started"
    );

    wait_for_signal().await?;

    info!(
        event.name = "system.shutdown_requested",
        timeout_ms = conf.shutdown_timeout.as_millis() as u64,
        "shutting down"
    );
    let result = tasks.shutdown_with_timeout(conf.shutdown_timeout).await;
    if !result.is_graceful() {
        warn!(
            event.name = "system.shutdown_forced",
            result = ?result,
            "some tasks did not stop in time and were aborted"
        );
    }

    let drops = pipeline.drops().snapshot();
    info!(
        event.name = "system.shutdown_completed",
        events.accepted = counter_value(&FLOW_EVENTS_TOTAL, &["accepted"]),
        drops.ingest = drops.ingest,
        drops.dedup = drops.dedup,
        drops.export = drops.export,
        "flowkeeper stopped"
    );

    if let Err(e) = std::fs::remove_file(&conf.capture_socket) {
        warn!(
            event.name = "system.socket_cleanup_failed",
            error.message = %e,
            "failed to remove capture socket"
        );
    }

    Ok(())
}

fn bind_capture_socket(path: &Path) -> Result<UnixListener, FlowkeeperError> {
    let wrap = |source| FlowkeeperError::CaptureSocket {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    // a previous run may have left the socket file behind
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(wrap(e)),
    }
    UnixListener::bind(path).map_err(wrap)
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

/// Consumer for the `direct` backend: logs every batch as JSON.
async fn log_batches(mut rx: mpsc::Receiver<ExportBatch>) {
    while let Some(batch) = rx.recv().await {
        match serde_json::to_string(&batch) {
            Ok(json) => info!(
                event.name = "exporter.direct.batch",
                records = batch.len(),
                batch = %json,
                "flow batch"
            ),
            Err(e) => error!(
                event.name = "exporter.direct.encode_failed",
                error.message = %e,
                "failed to encode flow batch"
            ),
        }
    }
}
