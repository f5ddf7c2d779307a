use std::time::Duration;

use async_trait::async_trait;
use tonic::{
    Request,
    client::Grpc,
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
};
use tracing::{debug, info};

use crate::{
    cache::AccountedFlow,
    exporters::{
        ExportBatch, ExportError, FlowExporter,
        pbflow::{CollectorReply, Records},
    },
};

const SEND_PATH: &str = "/pbflow.Collector/Send";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Unary gRPC client for `pbflow.Collector/Send`.
///
/// The channel connects lazily and reconnects on its own, so an unreachable
/// collector only fails the batches sent while it is down.
pub struct GrpcExporter {
    client: Grpc<Channel>,
    max_flows_per_message: usize,
}

impl GrpcExporter {
    pub fn new(host: &str, port: u16, max_flows_per_message: usize) -> Result<Self, ExportError> {
        let uri = endpoint_uri(host, port);
        let channel = Endpoint::from_shared(uri.clone())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();

        info!(
            event.name = "exporter.grpc.configured",
            endpoint = %uri,
            max_flows_per_message,
            "grpc exporter configured"
        );

        Ok(Self {
            client: Grpc::new(channel),
            max_flows_per_message: max_flows_per_message.max(1),
        })
    }

    async fn send(&mut self, records: Records) -> Result<(), ExportError> {
        self.client.ready().await?;
        let codec: ProstCodec<Records, CollectorReply> = ProstCodec::default();
        self.client
            .unary(
                Request::new(records),
                PathAndQuery::from_static(SEND_PATH),
                codec,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowExporter for GrpcExporter {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        let messages = split_messages(&batch.records, self.max_flows_per_message);
        let count = messages.len();
        for records in messages {
            self.send(records).await?;
        }
        debug!(
            event.name = "exporter.grpc.sent",
            messages = count,
            records = batch.len(),
            "sent flow records"
        );
        Ok(())
    }
}

/// Splits flows into messages of at most `max_flows` records each.
pub fn split_messages(flows: &[AccountedFlow], max_flows: usize) -> Vec<Records> {
    flows
        .chunks(max_flows.max(1))
        .map(Records::from_flows)
        .collect()
}

fn endpoint_uri(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}
