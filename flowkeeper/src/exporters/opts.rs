use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The single export backend active for the lifetime of the process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ExportBackend {
    #[default]
    #[serde(rename = "grpc")]
    Grpc,
    #[serde(rename = "kafka")]
    Kafka,
    #[serde(rename = "ipfix+udp")]
    IpfixUdp,
    #[serde(rename = "ipfix+tcp")]
    IpfixTcp,
    /// In-process handoff, no serialization.
    #[serde(rename = "direct")]
    Direct,
}

impl ExportBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportBackend::Grpc => "grpc",
            ExportBackend::Kafka => "kafka",
            ExportBackend::IpfixUdp => "ipfix+udp",
            ExportBackend::IpfixTcp => "ipfix+tcp",
            ExportBackend::Direct => "direct",
        }
    }

    /// Whether the backend dials `target_host:target_port`.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            ExportBackend::Grpc | ExportBackend::IpfixUdp | ExportBackend::IpfixTcp
        )
    }
}

impl std::fmt::Display for ExportBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KafkaCompression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha512,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KafkaTlsConf {
    pub enable: bool,
    /// Skip server certificate verification. Test setups only.
    pub insecure_skip_verify: bool,
    /// PEM bundle used to verify the brokers. Unset means the system roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KafkaSaslConf {
    pub enable: bool,
    pub mechanism: SaslMechanism,
    /// File holding the SASL username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_path: Option<PathBuf>,
    /// File holding the SASL password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KafkaConf {
    /// Bootstrap brokers, `host:port`.
    pub brokers: Vec<String>,
    pub topic: String,
    /// Max records per produce request.
    pub batch_messages: usize,
    /// Max encoded bytes per produce request.
    pub batch_bytes: usize,
    /// Fire-and-forget produce. Errors are only counted.
    #[serde(rename = "async")]
    pub async_produce: bool,
    pub compression: KafkaCompression,
    pub tls: KafkaTlsConf,
    pub sasl: KafkaSaslConf,
}

impl Default for KafkaConf {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            topic: "network-flows".to_string(),
            batch_messages: 1_000,
            batch_bytes: 1_048_576,
            async_produce: true,
            compression: KafkaCompression::None,
            tls: KafkaTlsConf::default(),
            sasl: KafkaSaslConf::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_round_trip_through_yaml() {
        for (name, backend) in [
            ("grpc", ExportBackend::Grpc),
            ("kafka", ExportBackend::Kafka),
            ("ipfix+udp", ExportBackend::IpfixUdp),
            ("ipfix+tcp", ExportBackend::IpfixTcp),
            ("direct", ExportBackend::Direct),
        ] {
            let parsed: ExportBackend = serde_yaml::from_str(name).expect("known backend");
            assert_eq!(parsed, backend);
            assert_eq!(backend.to_string(), name);
        }
        assert!(serde_yaml::from_str::<ExportBackend>("netflow").is_err());
    }

    #[test]
    fn kafka_conf_reads_async_and_sasl() {
        let conf: KafkaConf = serde_yaml::from_str(
            r#"
brokers: ["kafka-0:9092"]
async: false
compression: zstd
sasl:
  enable: true
  mechanism: scram_sha512
"#,
        )
        .expect("valid kafka conf");

        assert!(!conf.async_produce);
        assert_eq!(conf.compression, KafkaCompression::Zstd);
        assert_eq!(conf.sasl.mechanism, SaslMechanism::ScramSha512);
        assert_eq!(conf.topic, "network-flows");
        assert!(!conf.tls.enable);
    }
}
