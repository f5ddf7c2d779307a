use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::exporters::{ExportBatch, ExportError, FlowExporter};

/// Hands batches to an in-process consumer without serializing them.
///
/// Waits for room in the handoff channel, so a slow consumer backs up into the
/// export queue, where flows are dropped and counted.
pub struct DirectExporter {
    tx: mpsc::Sender<ExportBatch>,
}

impl DirectExporter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExportBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FlowExporter for DirectExporter {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        self.tx
            .send(batch.clone())
            .await
            .map_err(|_| ExportError::ConsumerClosed)
    }
}
