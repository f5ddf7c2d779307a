//! Startup errors surfaced by the binary.

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    exporters::ExportError,
    iface::agent_ip::AgentIpError,
    runtime::{RuntimeError, conf::ConfigError},
};

#[derive(Debug, Error)]
pub enum FlowkeeperError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build exporter: {0}")]
    Export(#[from] ExportError),

    #[error("failed to resolve the agent address: {0}")]
    AgentIp(#[from] AgentIpError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("capture socket {path}: {source}")]
    CaptureSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
