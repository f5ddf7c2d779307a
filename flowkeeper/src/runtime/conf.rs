use std::{
    error::Error,
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use flowkeeper_common::Direction;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{
    exporters::opts::{ExportBackend, KafkaConf},
    filter::{FilterAction, FilterError, FlowFilter, FlowFilterRule},
    iface::{
        agent_ip::{self, AgentIpError, AgentIpIface, AgentIpType},
        lister::InterfaceLister,
        selector::{InterfaceSelector, SelectorError},
    },
    runtime::{
        cli::Cli,
        conf::conf_serde::{duration, level},
    },
};

pub mod conf_serde;

/// How the interface source learns about interface changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Kernel link notifications (netlink).
    #[default]
    Watch,
    /// Periodic re-enumeration every `listen_poll_period`.
    Poll,
}

/// Which capture hookpoints are attached, and which events the pipeline admits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionMode {
    Ingress,
    Egress,
    #[default]
    Both,
}

impl DirectionMode {
    pub fn ingress(&self) -> bool {
        matches!(self, DirectionMode::Ingress | DirectionMode::Both)
    }

    pub fn egress(&self) -> bool {
        matches!(self, DirectionMode::Egress | DirectionMode::Both)
    }

    pub fn admits(&self, direction: Direction) -> bool {
        match direction {
            Direction::Ingress => self.ingress(),
            Direction::Egress => self.egress(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum DeduperMode {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "firstCome")]
    FirstCome,
}

/// Something worth telling the operator about once logging is up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfNotice {
    /// A deprecated option replaced the value of its successor.
    DeprecatedAlias {
        alias: &'static str,
        replaces: &'static str,
        value: String,
    },
    /// RTT needs both hookpoints and was turned off.
    RttDisabled { direction: DirectionMode },
}

/// The agent configuration. Built once at startup and never mutated afterwards.
///
/// Sources are layered as defaults < YAML file < `FLOWKEEPER_*` environment < CLI.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Conf {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(skip)]
    pub notices: Vec<ConfNotice>,

    #[serde(with = "level")]
    pub log_level: Level,

    /// Upper bound for the whole teardown sequence.
    #[serde(default = "defaults::shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,

    /// Unix socket the external capture helper connects to.
    #[serde(default = "defaults::capture_socket")]
    pub capture_socket: PathBuf,

    // Interface source
    /// Interface names to capture on. `/regex/` entries are regular expressions.
    /// Empty means every interface that is not excluded.
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default = "defaults::exclude_interfaces")]
    pub exclude_interfaces: Vec<String>,
    /// CIDRs; when set, only interfaces holding an address in one of them are used
    /// and the name lists are ignored.
    #[serde(default)]
    pub interface_ips: Vec<String>,
    #[serde(default)]
    pub listen_interfaces: ListenMode,
    #[serde(default = "defaults::listen_poll_period", with = "duration")]
    pub listen_poll_period: Duration,

    #[serde(default)]
    pub direction: DirectionMode,
    /// Admit one of every `sampling` events. 0 and 1 disable sampling.
    #[serde(default)]
    pub sampling: u32,

    // Queues
    /// Capacity of every inter-stage queue.
    #[serde(default = "defaults::buffers_length")]
    pub buffers_length: usize,
    /// Export queue capacity, when larger than `buffers_length`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter_buffer_length: Option<usize>,

    // Accounting cache
    #[serde(default = "defaults::cache_max_flows")]
    pub cache_max_flows: usize,
    #[serde(default = "defaults::cache_active_timeout", with = "duration")]
    pub cache_active_timeout: Duration,
    /// Defaults to a fifth of `cache_active_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration::option")]
    pub cache_sweep_interval: Option<Duration>,
    /// Shrink cache and dedup tables after sweeps that freed most of their capacity.
    #[serde(default = "defaults::force_reclaim")]
    pub force_reclaim: bool,

    // Deduplicator
    #[serde(default)]
    pub deduper: DeduperMode,
    /// Defaults to twice `cache_active_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration::option")]
    pub deduper_fc_expiry: Option<Duration>,
    #[serde(default)]
    pub deduper_just_mark: bool,
    #[serde(default = "defaults::deduper_merge")]
    pub deduper_merge: bool,

    // Flow filter
    #[serde(default)]
    pub enable_flow_filter: bool,
    #[serde(default)]
    pub flow_filter_rules: Vec<FlowFilterRule>,
    #[serde(default)]
    pub flow_filter_default_action: FilterAction,

    // Optional event fields
    #[serde(default)]
    pub enable_rtt: bool,
    #[serde(default)]
    pub enable_pkt_drops: bool,
    #[serde(default)]
    pub enable_dns_tracking: bool,
    #[serde(default = "defaults::dns_tracking_port")]
    pub dns_tracking_port: u16,
    #[serde(default)]
    pub enable_pkt_translation: bool,

    // Export
    #[serde(default)]
    pub export: ExportBackend,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default = "defaults::grpc_message_max_flows")]
    pub grpc_message_max_flows: usize,
    #[serde(default = "defaults::max_batch_records")]
    pub max_batch_records: usize,
    #[serde(default)]
    pub kafka: KafkaConf,

    // Agent address stamped on every exported flow
    /// Used as is when set; `agent_ip_iface` and `agent_ip_type` are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ip: Option<IpAddr>,
    /// `external`, `local` or `name:<interface>`.
    #[serde(default)]
    pub agent_ip_iface: AgentIpIface,
    #[serde(default)]
    pub agent_ip_type: AgentIpType,

    // Deprecated aliases
    /// Deprecated, use `target_host`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flows_target_host: String,
    /// Deprecated, use `target_port`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flows_target_port: u16,
    /// Deprecated, use `target_port`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pca_server_port: u16,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            config_path: None,
            notices: Vec::new(),
            log_level: Level::INFO,
            shutdown_timeout: defaults::shutdown_timeout(),
            capture_socket: defaults::capture_socket(),
            interfaces: Vec::new(),
            exclude_interfaces: defaults::exclude_interfaces(),
            interface_ips: Vec::new(),
            listen_interfaces: ListenMode::default(),
            listen_poll_period: defaults::listen_poll_period(),
            direction: DirectionMode::default(),
            sampling: 0,
            buffers_length: defaults::buffers_length(),
            exporter_buffer_length: None,
            cache_max_flows: defaults::cache_max_flows(),
            cache_active_timeout: defaults::cache_active_timeout(),
            cache_sweep_interval: None,
            force_reclaim: defaults::force_reclaim(),
            deduper: DeduperMode::default(),
            deduper_fc_expiry: None,
            deduper_just_mark: false,
            deduper_merge: defaults::deduper_merge(),
            enable_flow_filter: false,
            flow_filter_rules: Vec::new(),
            flow_filter_default_action: FilterAction::default(),
            enable_rtt: false,
            enable_pkt_drops: false,
            enable_dns_tracking: false,
            dns_tracking_port: defaults::dns_tracking_port(),
            enable_pkt_translation: false,
            export: ExportBackend::default(),
            target_host: String::new(),
            target_port: 0,
            grpc_message_max_flows: defaults::grpc_message_max_flows(),
            max_batch_records: defaults::max_batch_records(),
            kafka: KafkaConf::default(),
            agent_ip: None,
            agent_ip_iface: AgentIpIface::default(),
            agent_ip_type: AgentIpType::default(),
            flows_target_host: String::new(),
            flows_target_port: 0,
            pca_server_port: 0,
        }
    }
}

mod defaults {
    use std::{path::PathBuf, time::Duration};

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn capture_socket() -> PathBuf {
        PathBuf::from("/run/flowkeeper/capture.sock")
    }

    pub fn exclude_interfaces() -> Vec<String> {
        vec!["lo".to_string()]
    }

    pub fn listen_poll_period() -> Duration {
        Duration::from_secs(10)
    }

    pub fn buffers_length() -> usize {
        50
    }

    pub fn cache_max_flows() -> usize {
        5_000
    }

    pub fn cache_active_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn force_reclaim() -> bool {
        true
    }

    pub fn deduper_merge() -> bool {
        true
    }

    pub fn dns_tracking_port() -> u16 {
        53
    }

    pub fn grpc_message_max_flows() -> usize {
        10_000
    }

    pub fn max_batch_records() -> usize {
        1_000
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

impl Conf {
    /// Builds the configuration from defaults, the optional YAML file, the
    /// `FLOWKEEPER_*` environment and the CLI, in increasing priority, then
    /// applies the deprecated aliases.
    ///
    /// Semantic validation is a separate step, see [`Conf::validate`].
    ///
    /// # Errors
    /// * `ConfigError::NoConfigFile` - the given config path does not exist.
    /// * `ConfigError::InvalidConfigPath` - the config path is a directory.
    /// * `ConfigError::InvalidExtension` - the file is not `yaml`, `yml` or `hcl`.
    /// * `ConfigError::Extraction` - a value could not be deserialized.
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment
            .merge(Env::prefixed("FLOWKEEPER_").split("__"))
            .merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;
        conf.config_path = config_path_to_store;
        conf.notices = conf.resolve_deprecated();

        Ok((conf, cli))
    }

    /// Folds the deprecated target options into their successors.
    ///
    /// A non-empty `flows_target_host` replaces `target_host`. A non-zero
    /// `flows_target_port` replaces `target_port`; otherwise a non-zero
    /// `pca_server_port` does.
    pub fn resolve_deprecated(&mut self) -> Vec<ConfNotice> {
        let mut notices = Vec::new();

        if !self.flows_target_host.is_empty() {
            self.target_host = self.flows_target_host.clone();
            notices.push(ConfNotice::DeprecatedAlias {
                alias: "flows_target_host",
                replaces: "target_host",
                value: self.flows_target_host.clone(),
            });
        }

        if self.flows_target_port != 0 {
            self.target_port = self.flows_target_port;
            notices.push(ConfNotice::DeprecatedAlias {
                alias: "flows_target_port",
                replaces: "target_port",
                value: self.flows_target_port.to_string(),
            });
        } else if self.pca_server_port != 0 {
            self.target_port = self.pca_server_port;
            notices.push(ConfNotice::DeprecatedAlias {
                alias: "pca_server_port",
                replaces: "target_port",
                value: self.pca_server_port.to_string(),
            });
        }

        notices
    }

    /// Checks everything that deserialization cannot: sizes, the export target,
    /// selector and filter syntax, and that TLS/SASL material is readable.
    ///
    /// RTT is switched off (with a notice) unless both directions are captured.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.buffers_length == 0 {
            return Err(ConfigError::invalid("buffers_length", "must be greater than 0"));
        }
        if self.cache_max_flows == 0 {
            return Err(ConfigError::invalid("cache_max_flows", "must be greater than 0"));
        }
        if self.cache_active_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "cache_active_timeout",
                "must be greater than 0",
            ));
        }
        if self.max_batch_records == 0 {
            return Err(ConfigError::invalid("max_batch_records", "must be greater than 0"));
        }
        // also used by watch mode when netlink is unavailable
        if self.listen_poll_period.is_zero() {
            return Err(ConfigError::invalid(
                "listen_poll_period",
                "must be greater than 0",
            ));
        }
        if self.grpc_message_max_flows == 0 {
            return Err(ConfigError::invalid(
                "grpc_message_max_flows",
                "must be greater than 0",
            ));
        }

        if self.export.needs_target() {
            if self.target_host.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "target_host",
                    format!("required by the '{}' exporter", self.export),
                ));
            }
            if self.target_port == 0 {
                return Err(ConfigError::invalid(
                    "target_port",
                    format!("required by the '{}' exporter", self.export),
                ));
            }
        }

        if self.export == ExportBackend::Kafka {
            self.validate_kafka()?;
        }

        self.selector()?;
        if self.enable_flow_filter {
            self.flow_filter()?;
        }

        if self.enable_rtt && self.direction != DirectionMode::Both {
            self.enable_rtt = false;
            self.notices.push(ConfNotice::RttDisabled {
                direction: self.direction,
            });
        }

        Ok(())
    }

    fn validate_kafka(&self) -> Result<(), ConfigError> {
        let kafka = &self.kafka;
        if kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::invalid("kafka.brokers", "at least one broker is required"));
        }
        if kafka.topic.is_empty() {
            return Err(ConfigError::invalid("kafka.topic", "must not be empty"));
        }
        if kafka.batch_messages == 0 || kafka.batch_bytes == 0 {
            return Err(ConfigError::invalid(
                "kafka.batch_messages",
                "batch limits must be greater than 0",
            ));
        }

        if kafka.tls.enable {
            check_readable("kafka.tls.ca_cert_path", kafka.tls.ca_cert_path.as_deref())?;
            check_readable("kafka.tls.user_cert_path", kafka.tls.user_cert_path.as_deref())?;
            check_readable("kafka.tls.user_key_path", kafka.tls.user_key_path.as_deref())?;
            if kafka.tls.user_cert_path.is_some() != kafka.tls.user_key_path.is_some() {
                return Err(ConfigError::invalid(
                    "kafka.tls",
                    "user_cert_path and user_key_path must be set together",
                ));
            }
        }

        if kafka.sasl.enable {
            for (field, path) in [
                ("kafka.sasl.client_id_path", &kafka.sasl.client_id_path),
                ("kafka.sasl.client_secret_path", &kafka.sasl.client_secret_path),
            ] {
                match path {
                    Some(path) => check_readable(field, Some(path))?,
                    None => return Err(ConfigError::invalid(field, "required when sasl is enabled")),
                }
            }
        }

        Ok(())
    }

    pub fn selector(&self) -> Result<InterfaceSelector, ConfigError> {
        Ok(InterfaceSelector::new(
            &self.interfaces,
            &self.exclude_interfaces,
            &self.interface_ips,
        )?)
    }

    pub fn flow_filter(&self) -> Result<FlowFilter, ConfigError> {
        Ok(FlowFilter::new(
            &self.flow_filter_rules,
            self.flow_filter_default_action,
        )?)
    }

    /// How long a dedup owner survives without traffic.
    pub fn dedup_expiry(&self) -> Duration {
        self.deduper_fc_expiry
            .unwrap_or(self.cache_active_timeout * 2)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.cache_sweep_interval
            .unwrap_or(self.cache_active_timeout / 5)
            .max(MIN_SWEEP_INTERVAL)
    }

    /// The address stamped on exported flows. Called once at startup.
    pub fn resolve_agent_ip(&self, lister: &dyn InterfaceLister) -> Result<IpAddr, AgentIpError> {
        agent_ip::resolve(self.agent_ip, &self.agent_ip_iface, self.agent_ip_type, lister)
    }

    pub fn export_queue_capacity(&self) -> usize {
        self.exporter_buffer_length
            .map_or(self.buffers_length, |len| len.max(self.buffers_length))
    }
}

fn check_readable(field: &'static str, path: Option<&Path>) -> Result<(), ConfigError> {
    let Some(path) = path else {
        return Ok(());
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ConfigError::UnreadableFile {
            field,
            path: path.to_path_buf(),
        }),
    }
}

/// Validates that the given path points to an existing file with a supported extension.
///
/// # Errors
///
/// * `ConfigError::NoConfigFile` - If the path does not exist.
/// * `ConfigError::InvalidConfigPath` - If the path points to a directory.
/// * `ConfigError::InvalidExtension` - If the file extension is not `yaml`, `yml`, or `hcl`.
fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfigError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        } else {
            return Err(ConfigError::NoConfigFile);
        }
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") | Some("hcl") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// The specified configuration file does not exist.
    NoConfigFile,
    /// The path exists but is not a file (e.g., it's a directory).
    InvalidConfigPath(String),
    /// The file has an unsupported extension.
    InvalidExtension(String),
    /// Failed to extract configuration data.
    Extraction(Box<figment::Error>),
    /// A value deserialized fine but makes no sense.
    Invalid { field: &'static str, reason: String },
    /// A TLS or SASL file is missing or not a regular file.
    UnreadableFile { field: &'static str, path: PathBuf },
    Selector(SelectorError),
    Filter(FilterError),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoConfigFile => write!(f, "no config file provided"),
            ConfigError::InvalidConfigPath(p) => write!(f, "path '{p}' is not a valid file"),
            ConfigError::InvalidExtension(ext) => {
                write!(
                    f,
                    "invalid file extension '.{ext}', expected 'yaml', 'yml', or 'hcl'"
                )
            }
            ConfigError::Extraction(e) => write!(f, "configuration error: {e}"),
            ConfigError::Invalid { field, reason } => write!(f, "invalid '{field}': {reason}"),
            ConfigError::UnreadableFile { field, path } => {
                write!(f, "'{field}' points to unreadable file '{}'", path.display())
            }
            ConfigError::Selector(e) => write!(f, "interface selection: {e}"),
            ConfigError::Filter(e) => write!(f, "flow filter: {e}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Extraction(e) => Some(e),
            ConfigError::Selector(e) => Some(e),
            ConfigError::Filter(e) => Some(e),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extraction(Box::from(e))
    }
}

impl From<SelectorError> for ConfigError {
    fn from(e: SelectorError) -> Self {
        ConfigError::Selector(e)
    }
}

impl From<FilterError> for ConfigError {
    fn from(e: FilterError) -> Self {
        ConfigError::Filter(e)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use figment::Jail;
    use tracing::Level;

    use super::*;

    fn grpc_conf() -> Conf {
        Conf {
            target_host: "collector".to_string(),
            target_port: 9999,
            ..Conf::default()
        }
    }

    #[test]
    fn default_impl_matches_documented_defaults() {
        let cfg = Conf::default();
        assert_eq!(cfg.config_path, None);
        assert_eq!(cfg.log_level, Level::INFO);
        assert_eq!(cfg.exclude_interfaces, vec!["lo".to_string()]);
        assert_eq!(cfg.listen_interfaces, ListenMode::Watch);
        assert_eq!(cfg.buffers_length, 50);
        assert_eq!(cfg.cache_max_flows, 5_000);
        assert_eq!(cfg.cache_active_timeout, Duration::from_secs(5));
        assert_eq!(cfg.deduper, DeduperMode::None);
        assert!(cfg.deduper_merge);
        assert!(!cfg.deduper_just_mark);
        assert_eq!(cfg.export, ExportBackend::Grpc);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(cfg.agent_ip_iface, AgentIpIface::External);
        assert_eq!(cfg.agent_ip_type, AgentIpType::Any);
    }

    #[test]
    fn derived_timings() {
        let mut cfg = Conf::default();
        assert_eq!(cfg.dedup_expiry(), Duration::from_secs(10));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));

        cfg.cache_active_timeout = Duration::from_millis(200);
        assert_eq!(cfg.sweep_interval(), MIN_SWEEP_INTERVAL);

        cfg.deduper_fc_expiry = Some(Duration::from_secs(3));
        cfg.cache_sweep_interval = Some(Duration::from_millis(250));
        assert_eq!(cfg.dedup_expiry(), Duration::from_secs(3));
        assert_eq!(cfg.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn export_queue_uses_the_larger_capacity() {
        let mut cfg = Conf::default();
        assert_eq!(cfg.export_queue_capacity(), 50);
        cfg.exporter_buffer_length = Some(500);
        assert_eq!(cfg.export_queue_capacity(), 500);
        cfg.exporter_buffer_length = Some(10);
        assert_eq!(cfg.export_queue_capacity(), 50);
    }

    #[test]
    fn conf_survives_yaml_round_trip() {
        let cfg = grpc_conf();
        let serialized = serde_yaml::to_string(&cfg).expect("should serialize");
        let deserialized: Conf = serde_yaml::from_str(&serialized).expect("should deserialize");

        assert_eq!(deserialized.target_host, cfg.target_host);
        assert_eq!(deserialized.cache_active_timeout, cfg.cache_active_timeout);
        assert_eq!(deserialized.cache_sweep_interval, None);
        assert!(!serialized.contains("flows_target_host"));
    }

    #[test]
    fn new_succeeds_without_config_path() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["flowkeeper"]);
            let (cfg, _cli) = Conf::new(cli).expect("config should load without path");
            assert_eq!(cfg.config_path, None);
            assert!(cfg.notices.is_empty());

            Ok(())
        })
    }

    #[test]
    fn new_errors_with_nonexistent_config_file() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["flowkeeper", "--config", "nonexistent.yaml"]);
            let err = Conf::new(cli).expect_err("expected error with nonexistent file");
            assert!(
                err.to_string().contains("no config file provided"),
                "unexpected error: {err}"
            );

            Ok(())
        })
    }

    #[test]
    fn new_errors_with_directory_as_config_path() {
        Jail::expect_with(|jail| {
            jail.create_dir("a_directory")?;

            let cli = Cli::parse_from(["flowkeeper", "--config", "a_directory"]);
            let err = Conf::new(cli).expect_err("expected error with directory path");
            assert!(
                err.to_string().contains("is not a valid file"),
                "unexpected error: {err}"
            );

            Ok(())
        })
    }

    #[test]
    fn new_errors_with_invalid_config_extension() {
        Jail::expect_with(|jail| {
            jail.create_file("flowkeeper.toml", "")?;

            let cli = Cli::parse_from(["flowkeeper", "--config", "flowkeeper.toml"]);
            let err = Conf::new(cli).expect_err("expected error with invalid extension");
            assert!(
                err.to_string().contains("invalid file extension '.toml'"),
                "unexpected error: {err}"
            );

            Ok(())
        })
    }

    #[test]
    fn loads_yaml_file_and_cli_overrides_log_level() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "flowkeeper.yaml",
                r#"
log_level: warn
interfaces: ["eth0", "/^veth/"]
listen_interfaces: poll
listen_poll_period: 2s
cache_active_timeout: 15s
deduper: firstCome
deduper_just_mark: true
export: ipfix+udp
target_host: 10.0.0.5
target_port: 4739
flow_filter_rules:
  - ip_cidr: 10.0.0.0/8
    protocol: TCP
    action: reject
"#,
            )?;

            let cli = Cli::parse_from([
                "flowkeeper",
                "--config",
                "flowkeeper.yaml",
                "--log-level",
                "debug",
            ]);
            let (cfg, _cli) = Conf::new(cli).expect("config loads from yaml file");
            assert_eq!(cfg.log_level, Level::DEBUG);
            assert_eq!(cfg.interfaces, vec!["eth0".to_string(), "/^veth/".to_string()]);
            assert_eq!(cfg.listen_interfaces, ListenMode::Poll);
            assert_eq!(cfg.listen_poll_period, Duration::from_secs(2));
            assert_eq!(cfg.dedup_expiry(), Duration::from_secs(30));
            assert_eq!(cfg.deduper, DeduperMode::FirstCome);
            assert!(cfg.deduper_just_mark);
            assert_eq!(cfg.export, ExportBackend::IpfixUdp);
            assert_eq!(cfg.flow_filter_rules.len(), 1);
            assert_eq!(cfg.flow_filter_rules[0].action, FilterAction::Reject);
            assert_eq!(cfg.config_path, Some(PathBuf::from("flowkeeper.yaml")));

            Ok(())
        });
    }

    #[test]
    fn agent_ip_options_from_yaml_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "flowkeeper.yaml",
                "agent_ip_iface: name:eth0\nagent_ip_type: ipv6\n",
            )?;

            let cli = Cli::parse_from(["flowkeeper", "--config", "flowkeeper.yaml"]);
            let (cfg, _cli) = Conf::new(cli).expect("config loads");
            assert_eq!(cfg.agent_ip, None);
            assert_eq!(cfg.agent_ip_iface, AgentIpIface::Name("eth0".to_string()));
            assert_eq!(cfg.agent_ip_type, AgentIpType::Ipv6);

            jail.set_env("FLOWKEEPER_AGENT_IP", "10.1.2.3");
            let cli = Cli::parse_from(["flowkeeper", "--config", "flowkeeper.yaml"]);
            let (cfg, _cli) = Conf::new(cli).expect("config loads");
            assert_eq!(cfg.agent_ip, Some("10.1.2.3".parse().expect("valid ip")));

            jail.create_file("bad.yaml", "agent_ip_iface: wlan0\n")?;
            let cli = Cli::parse_from(["flowkeeper", "--config", "bad.yaml"]);
            assert!(matches!(Conf::new(cli), Err(ConfigError::Extraction(_))));

            Ok(())
        });
    }

    #[test]
    fn yaml_log_level_applies_without_cli_flag() {
        Jail::expect_with(|jail| {
            jail.create_file("flowkeeper.yml", "log_level: trace\n")?;

            let cli = Cli::parse_from(["flowkeeper", "--config", "flowkeeper.yml"]);
            let (cfg, _cli) = Conf::new(cli).expect("config loads");
            assert_eq!(cfg.log_level, Level::TRACE);

            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("flowkeeper.yaml", "cache_max_flows: 100\ntarget_port: 1\n")?;
            jail.set_env("FLOWKEEPER_CONFIG_PATH", "flowkeeper.yaml");
            jail.set_env("FLOWKEEPER_CACHE_MAX_FLOWS", "200");
            jail.set_env("FLOWKEEPER_KAFKA__TOPIC", "flows");

            let cli = Cli::parse_from(["flowkeeper"]);
            let (cfg, _cli) = Conf::new(cli).expect("config loads");
            assert_eq!(cfg.cache_max_flows, 200);
            assert_eq!(cfg.target_port, 1);
            assert_eq!(cfg.kafka.topic, "flows");

            Ok(())
        });
    }

    #[test]
    fn deprecated_host_overrides_target_host() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "flowkeeper.yaml",
                "target_host: B\nflows_target_host: A\ntarget_port: 2055\n",
            )?;

            let cli = Cli::parse_from(["flowkeeper", "--config", "flowkeeper.yaml"]);
            let (cfg, _cli) = Conf::new(cli).expect("config loads");
            assert_eq!(cfg.target_host, "A");
            assert_eq!(cfg.target_port, 2055);
            assert_eq!(
                cfg.notices,
                vec![ConfNotice::DeprecatedAlias {
                    alias: "flows_target_host",
                    replaces: "target_host",
                    value: "A".to_string(),
                }]
            );

            Ok(())
        });
    }

    #[test]
    fn deprecated_port_precedence() {
        let mut cfg = Conf {
            target_port: 1234,
            flows_target_port: 0,
            pca_server_port: 9999,
            ..Conf::default()
        };
        cfg.resolve_deprecated();
        assert_eq!(cfg.target_port, 9999);

        let mut cfg = Conf {
            target_port: 1234,
            flows_target_port: 7777,
            pca_server_port: 9999,
            ..Conf::default()
        };
        cfg.resolve_deprecated();
        assert_eq!(cfg.target_port, 7777);

        let mut cfg = Conf {
            target_host: "kept".to_string(),
            target_port: 1234,
            ..Conf::default()
        };
        assert!(cfg.resolve_deprecated().is_empty());
        assert_eq!(cfg.target_host, "kept");
        assert_eq!(cfg.target_port, 1234);
    }

    #[test]
    fn validate_requires_target_for_network_backends() {
        let mut cfg = Conf::default();
        let err = cfg.validate().expect_err("grpc without host");
        assert!(err.to_string().contains("target_host"), "unexpected error: {err}");

        let mut cfg = Conf {
            target_host: "collector".to_string(),
            ..Conf::default()
        };
        let err = cfg.validate().expect_err("grpc without port");
        assert!(err.to_string().contains("target_port"), "unexpected error: {err}");

        let mut cfg = Conf {
            export: ExportBackend::Direct,
            ..Conf::default()
        };
        cfg.validate().expect("direct needs no target");
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let mut cfg = Conf {
            buffers_length: 0,
            ..grpc_conf()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "buffers_length", .. })
        ));

        let mut cfg = Conf {
            cache_max_flows: 0,
            ..grpc_conf()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "cache_max_flows", .. })
        ));
    }

    #[test]
    fn zero_poll_period_from_yaml_fails_validation() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "flowkeeper.yaml",
                "listen_poll_period: 0s\nexport: direct\n",
            )?;

            let cli = Cli::parse_from(["flowkeeper", "--config", "flowkeeper.yaml"]);
            let (mut cfg, _cli) = Conf::new(cli).expect("config loads");
            assert_eq!(cfg.listen_poll_period, Duration::ZERO);
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::Invalid { field: "listen_poll_period", .. })
            ));

            Ok(())
        });
    }

    #[test]
    fn validate_kafka_requires_brokers_and_readable_material() {
        let mut cfg = Conf {
            export: ExportBackend::Kafka,
            ..Conf::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "kafka.brokers", .. })
        ));

        cfg.kafka.brokers = vec!["kafka:9092".to_string()];
        cfg.kafka.tls.enable = true;
        cfg.kafka.tls.ca_cert_path = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnreadableFile { field: "kafka.tls.ca_cert_path", .. })
        ));

        cfg.kafka.tls.enable = false;
        cfg.kafka.sasl.enable = true;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "kafka.sasl.client_id_path", .. })
        ));

        cfg.kafka.sasl.enable = false;
        cfg.validate().expect("plain kafka is valid");
    }

    #[test]
    fn validate_surfaces_selector_and_filter_errors() {
        let mut cfg = Conf {
            interfaces: vec!["/([/".to_string()],
            ..grpc_conf()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Selector(_))));

        let mut cfg = Conf {
            enable_flow_filter: true,
            flow_filter_rules: vec![FlowFilterRule {
                ip_cidr: Some("10.0.0.0/99".to_string()),
                ..FlowFilterRule::default()
            }],
            ..grpc_conf()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Filter(_))));
    }

    #[test]
    fn rtt_is_disabled_unless_both_directions() {
        let mut cfg = Conf {
            enable_rtt: true,
            direction: DirectionMode::Ingress,
            ..grpc_conf()
        };
        cfg.validate().expect("valid");
        assert!(!cfg.enable_rtt);
        assert_eq!(
            cfg.notices,
            vec![ConfNotice::RttDisabled {
                direction: DirectionMode::Ingress
            }]
        );

        let mut cfg = Conf {
            enable_rtt: true,
            ..grpc_conf()
        };
        cfg.validate().expect("valid");
        assert!(cfg.enable_rtt);
    }
}
