use std::{collections::BTreeMap, fs, io, ops::Range, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use rskafka::{
    client::{
        ClientBuilder, Credentials, SaslConfig,
        partition::{Compression, PartitionClient, UnknownTopicHandling},
    },
    record::Record,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    exporters::{
        ExportBatch, ExportError, FlowExporter,
        opts::{KafkaCompression, KafkaConf, KafkaSaslConf, SaslMechanism},
        pbflow, tls,
    },
    metrics::registry::EXPORT_RECORDS_TOTAL,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_INFLIGHT_PRODUCES: usize = 64;

/// SASL username and password read from files at startup.
#[derive(Clone, PartialEq, Eq)]
struct SaslCredentials {
    mechanism: SaslMechanism,
    username: String,
    password: String,
}

impl std::fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl SaslCredentials {
    fn load(conf: &KafkaSaslConf) -> Result<Self, ExportError> {
        let read = |field: &str, path: Option<&Path>| -> Result<String, ExportError> {
            let path =
                path.ok_or_else(|| ExportError::Credentials(format!("{field} is not set")))?;
            let value = fs::read_to_string(path).map_err(|e| {
                ExportError::Credentials(format!("cannot read {field} '{}': {e}", path.display()))
            })?;
            Ok(value.trim().to_string())
        };

        Ok(Self {
            mechanism: conf.mechanism,
            username: read("client_id_path", conf.client_id_path.as_deref())?,
            password: read("client_secret_path", conf.client_secret_path.as_deref())?,
        })
    }

    fn config(&self) -> SaslConfig {
        let credentials = Credentials::new(self.username.clone(), self.password.clone());
        match self.mechanism {
            SaslMechanism::Plain => SaslConfig::Plain(credentials),
            SaslMechanism::ScramSha512 => SaslConfig::ScramSha512(credentials),
        }
    }
}

/// Produces one protobuf `pbflow.Record` per flow to a Kafka topic.
///
/// Connects on the first batch and again after any failure. Records are spread
/// over the topic's partitions round-robin, one produce request per chunk.
pub struct KafkaExporter {
    brokers: Vec<String>,
    topic: String,
    batch_messages: usize,
    batch_bytes: usize,
    async_produce: bool,
    compression: Compression,
    tls: Option<Arc<rustls::ClientConfig>>,
    sasl: Option<SaslCredentials>,
    partitions: Vec<Arc<PartitionClient>>,
    next_partition: usize,
    inflight: JoinSet<(usize, Result<(), ExportError>)>,
}

impl KafkaExporter {
    pub fn new(conf: &KafkaConf) -> Result<Self, ExportError> {
        let tls = if conf.tls.enable {
            Some(tls::client_config(&conf.tls)?)
        } else {
            None
        };
        let sasl = if conf.sasl.enable {
            Some(SaslCredentials::load(&conf.sasl)?)
        } else {
            None
        };

        info!(
            event.name = "exporter.kafka.configured",
            brokers = ?conf.brokers,
            topic = %conf.topic,
            tls = conf.tls.enable,
            sasl = conf.sasl.enable,
            async_produce = conf.async_produce,
            "kafka exporter configured"
        );

        Ok(Self {
            brokers: conf
                .brokers
                .iter()
                .filter(|b| !b.trim().is_empty())
                .cloned()
                .collect(),
            topic: conf.topic.clone(),
            batch_messages: conf.batch_messages.max(1),
            batch_bytes: conf.batch_bytes.max(1),
            async_produce: conf.async_produce,
            compression: compression(conf.compression),
            tls,
            sasl,
            partitions: Vec::new(),
            next_partition: 0,
            inflight: JoinSet::new(),
        })
    }

    async fn connect(&mut self) -> Result<(), ExportError> {
        let mut builder = ClientBuilder::new(self.brokers.clone());
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(Arc::clone(tls));
        }
        if let Some(sasl) = &self.sasl {
            builder = builder.sasl_config(sasl.config());
        }

        let client = tokio::time::timeout(CONNECT_TIMEOUT, builder.build())
            .await
            .map_err(|_| ExportError::Connect {
                target: self.brokers.join(","),
                source: io::Error::new(io::ErrorKind::TimedOut, "bootstrap timed out"),
            })??;

        let partition_ids: Vec<i32> = client
            .list_topics()
            .await?
            .into_iter()
            .find(|topic| topic.name == self.topic)
            .map(|topic| topic.partitions.into_iter().collect())
            .unwrap_or_default();
        if partition_ids.is_empty() {
            return Err(ExportError::NoPartitions(self.topic.clone()));
        }

        let mut partitions = Vec::with_capacity(partition_ids.len());
        for id in partition_ids {
            let partition = client
                .partition_client(self.topic.clone(), id, UnknownTopicHandling::Retry)
                .await?;
            partitions.push(Arc::new(partition));
        }

        info!(
            event.name = "exporter.kafka.connected",
            topic = %self.topic,
            partitions = partitions.len(),
            "connected to kafka"
        );
        self.partitions = partitions;
        Ok(())
    }

    fn next_partition(&mut self) -> Option<Arc<PartitionClient>> {
        if self.partitions.is_empty() {
            return None;
        }
        let partition = Arc::clone(&self.partitions[self.next_partition % self.partitions.len()]);
        self.next_partition = self.next_partition.wrapping_add(1);
        Some(partition)
    }

    /// Collects finished background produces, counting their failures.
    fn reap(&mut self) {
        while let Some(joined) = self.inflight.try_join_next() {
            record_async_outcome(joined);
        }
    }

    async fn produce(&mut self, records: Vec<Record>) -> Result<(), ExportError> {
        let Some(partition) = self.next_partition() else {
            return Err(ExportError::NoPartitions(self.topic.clone()));
        };
        let compression = self.compression;

        if !self.async_produce {
            partition.produce(records, compression).await?;
            return Ok(());
        }

        while self.inflight.len() >= MAX_INFLIGHT_PRODUCES {
            if let Some(joined) = self.inflight.join_next().await {
                record_async_outcome(joined);
            }
        }
        let count = records.len();
        self.inflight.spawn(async move {
            let result = partition
                .produce(records, compression)
                .await
                .map(|_| ())
                .map_err(ExportError::from);
            (count, result)
        });
        Ok(())
    }
}

fn record_async_outcome(joined: Result<(usize, Result<(), ExportError>), tokio::task::JoinError>) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((count, Err(e))) => {
            EXPORT_RECORDS_TOTAL
                .with_label_values(&["kafka", "async_error"])
                .inc_by(count as u64);
            warn!(
                event.name = "exporter.kafka.async_produce_failed",
                records = count,
                error = %e,
                "background kafka produce failed"
            );
        }
        Err(e) => warn!(
            event.name = "exporter.kafka.async_produce_aborted",
            error = %e,
            "background kafka produce did not complete"
        ),
    }
}

#[async_trait]
impl FlowExporter for KafkaExporter {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn export(&mut self, batch: &ExportBatch) -> Result<(), ExportError> {
        self.reap();
        if self.partitions.is_empty() {
            self.connect().await?;
        }

        let encoded: Vec<Vec<u8>> = batch
            .records
            .iter()
            .map(|flow| pbflow::Record::from(flow).encode_to_vec())
            .collect();
        let timestamps: Vec<DateTime<Utc>> = batch
            .records
            .iter()
            .map(|flow| DateTime::from_timestamp_nanos(flow.last_seen_ns as i64))
            .collect();
        let sizes: Vec<usize> = encoded.iter().map(Vec::len).collect();

        let mut encoded = encoded.into_iter();
        for range in chunk_ranges(&sizes, self.batch_messages, self.batch_bytes) {
            let records: Vec<Record> = range
                .clone()
                .zip(encoded.by_ref())
                .map(|(i, value)| Record {
                    key: None,
                    value: Some(value),
                    headers: BTreeMap::new(),
                    timestamp: timestamps[i],
                })
                .collect();

            if let Err(e) = self.produce(records).await {
                // drop the partition clients so the next batch reconnects
                self.partitions.clear();
                return Err(e);
            }
        }

        debug!(
            event.name = "exporter.kafka.produced",
            records = batch.len(),
            "produced flow records"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ExportError> {
        while let Some(joined) = self.inflight.join_next().await {
            record_async_outcome(joined);
        }
        Ok(())
    }
}

fn compression(conf: KafkaCompression) -> Compression {
    match conf {
        KafkaCompression::None => Compression::NoCompression,
        KafkaCompression::Gzip => Compression::Gzip,
        KafkaCompression::Snappy => Compression::Snappy,
        KafkaCompression::Lz4 => Compression::Lz4,
        KafkaCompression::Zstd => Compression::Zstd,
    }
}

/// Groups consecutive records into produce requests bounded by count and bytes.
/// A record larger than `max_bytes` travels alone.
pub fn chunk_ranges(sizes: &[usize], max_messages: usize, max_bytes: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, size) in sizes.iter().enumerate() {
        let count = i - start;
        if count > 0 && (count >= max_messages || bytes + size > max_bytes) {
            ranges.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }
    if start < sizes.len() {
        ranges.push(start..sizes.len());
    }
    ranges
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn chunks_respect_message_and_byte_limits() {
        assert_eq!(chunk_ranges(&[10; 5], 2, 1000), vec![0..2, 2..4, 4..5]);
        assert_eq!(chunk_ranges(&[40, 40, 40], 10, 100), vec![0..2, 2..3]);
        assert_eq!(chunk_ranges(&[500, 10, 10], 10, 100), vec![0..1, 1..3]);
        assert!(chunk_ranges(&[], 10, 100).is_empty());
    }

    #[test]
    fn sasl_credentials_are_read_and_trimmed() {
        let mut id = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(id, "flow-user").expect("write");
        let mut secret = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(secret, "s3cret  ").expect("write");

        let creds = SaslCredentials::load(&KafkaSaslConf {
            enable: true,
            mechanism: SaslMechanism::ScramSha512,
            client_id_path: Some(id.path().to_path_buf()),
            client_secret_path: Some(secret.path().to_path_buf()),
        })
        .expect("credentials load");

        assert_eq!(creds.username, "flow-user");
        assert_eq!(creds.password, "s3cret");
        assert!(!format!("{creds:?}").contains("s3cret"));
    }

    #[test]
    fn missing_sasl_file_fails_construction() {
        let conf = KafkaConf {
            brokers: vec!["localhost:9092".to_string()],
            sasl: KafkaSaslConf {
                enable: true,
                mechanism: SaslMechanism::Plain,
                client_id_path: Some("/nonexistent/id".into()),
                client_secret_path: Some("/nonexistent/secret".into()),
            },
            ..Default::default()
        };
        assert!(matches!(
            KafkaExporter::new(&conf),
            Err(ExportError::Credentials(_))
        ));
    }

    #[test]
    fn plain_exporter_starts_disconnected() {
        let conf = KafkaConf {
            brokers: vec!["localhost:9092".to_string(), " ".to_string()],
            compression: KafkaCompression::Zstd,
            ..Default::default()
        };
        let exporter = KafkaExporter::new(&conf).expect("exporter builds");
        assert_eq!(exporter.brokers, vec!["localhost:9092".to_string()]);
        assert!(exporter.partitions.is_empty());
        assert!(matches!(exporter.compression, Compression::Zstd));
    }
}
