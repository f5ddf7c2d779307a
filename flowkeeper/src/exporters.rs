//! Batching and the single active export backend.

use std::{net::IpAddr, time::Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    cache::AccountedFlow,
    metrics::registry::{EXPORT_BATCH_SIZE, EXPORT_RECORDS_TOTAL, PROCESSING_LATENCY_SECONDS},
    runtime::conf::Conf,
};

pub mod direct;
pub mod grpc;
pub mod ipfix;
pub mod kafka;
pub mod opts;
pub mod pbflow;
mod tls;

use opts::ExportBackend;

/// Finished flows handed to the backend in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportBatch {
    pub records: Vec<AccountedFlow>,
}

impl ExportBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot reach {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("grpc call failed: {0}")]
    Status(Box<tonic::Status>),

    #[error("kafka error: {0}")]
    Kafka(#[from] rskafka::client::error::Error),

    #[error("topic '{0}' has no partitions")]
    NoPartitions(String),

    #[error("tls configuration: {0}")]
    Tls(String),

    #[error("sasl credentials: {0}")]
    Credentials(String),

    #[error("direct consumer has gone away")]
    ConsumerClosed,
}

impl From<tonic::Status> for ExportError {
    fn from(status: tonic::Status) -> Self {
        ExportError::Status(Box::new(status))
    }
}

/// A wire protocol for finished flows.
///
/// `export` is called from a single task, one batch at a time. An error is
/// logged and counted by the caller, and the next batch is attempted normally.
#[async_trait]
pub trait FlowExporter: Send {
    fn name(&self) -> &'static str;

    async fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError>;

    async fn shutdown(&mut self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// The configured backend and, for `direct`, the receiving end of the handoff.
pub struct BuiltExporter {
    pub exporter: Box<dyn FlowExporter>,
    pub direct_rx: Option<mpsc::Receiver<ExportBatch>>,
}

pub async fn build_exporter(conf: &Conf) -> Result<BuiltExporter, ExportError> {
    let target = format!("{}:{}", conf.target_host, conf.target_port);
    info!(
        event.name = "exporter.building",
        exporter = %conf.export,
        "building flow exporter"
    );

    let exporter: Box<dyn FlowExporter> = match conf.export {
        ExportBackend::Grpc => Box::new(grpc::GrpcExporter::new(
            &conf.target_host,
            conf.target_port,
            conf.grpc_message_max_flows,
        )?),
        ExportBackend::Kafka => Box::new(kafka::KafkaExporter::new(&conf.kafka)?),
        ExportBackend::IpfixUdp => Box::new(ipfix::IpfixUdpExporter::connect(&target).await?),
        ExportBackend::IpfixTcp => Box::new(ipfix::IpfixTcpExporter::new(target)),
        ExportBackend::Direct => {
            let (exporter, rx) = direct::DirectExporter::channel(conf.export_queue_capacity());
            return Ok(BuiltExporter {
                exporter: Box::new(exporter),
                direct_rx: Some(rx),
            });
        }
    };

    Ok(BuiltExporter {
        exporter,
        direct_rx: None,
    })
}

/// Drains the export queue into batches until every sender is gone.
///
/// Each batch is the first waiting flow plus whatever else is already queued,
/// up to `max_batch_records`. The worker never waits to fill a batch. Every
/// flow is stamped with `agent_ip`.
pub async fn run_fanout(
    mut exporter: Box<dyn FlowExporter>,
    mut rx: mpsc::Receiver<AccountedFlow>,
    max_batch_records: usize,
    agent_ip: IpAddr,
) {
    let max_batch_records = max_batch_records.max(1);
    let name = exporter.name();
    info!(
        event.name = "exporter.started",
        exporter = name,
        max_batch_records,
        agent.ip = %agent_ip,
        "export fan-out started"
    );

    while let Some(first) = rx.recv().await {
        let mut records = Vec::with_capacity(max_batch_records.min(rx.len() + 1));
        records.push(first);
        while records.len() < max_batch_records {
            match rx.try_recv() {
                Ok(flow) => records.push(flow),
                Err(_) => break,
            }
        }

        for flow in &mut records {
            flow.agent_ip = Some(agent_ip);
        }
        let batch = ExportBatch { records };
        export_one(exporter.as_mut(), &batch).await;
    }

    if let Err(e) = exporter.shutdown().await {
        warn!(
            event.name = "exporter.shutdown_failed",
            exporter = name,
            error = %e,
            "exporter did not shut down cleanly"
        );
    }
    info!(
        event.name = "exporter.stopped",
        exporter = name,
        "export fan-out stopped"
    );
}

async fn export_one(exporter: &mut dyn FlowExporter, batch: &ExportBatch) {
    let name = exporter.name();
    let started = Instant::now();
    EXPORT_BATCH_SIZE.observe(batch.len() as f64);

    match exporter.export(batch).await {
        Ok(()) => {
            EXPORT_RECORDS_TOTAL
                .with_label_values(&[name, "ok"])
                .inc_by(batch.len() as u64);
            debug!(
                event.name = "exporter.batch_sent",
                exporter = name,
                records = batch.len(),
                "exported flow batch"
            );
        }
        Err(e) => {
            EXPORT_RECORDS_TOTAL
                .with_label_values(&[name, "error"])
                .inc_by(batch.len() as u64);
            error!(
                event.name = "exporter.batch_failed",
                exporter = name,
                records = batch.len(),
                error = %e,
                "failed to export flow batch"
            );
        }
    }

    PROCESSING_LATENCY_SECONDS
        .with_label_values(&["export"])
        .observe(started.elapsed().as_secs_f64());
}
