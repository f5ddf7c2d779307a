use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::runtime::{
    cli::Cli,
    conf::{Conf, ConfNotice, ConfigError},
};

pub mod cli;
pub mod conf;
pub mod memory;
pub mod task_manager;

pub struct Runtime {
    pub cli: Cli,
    pub conf: Arc<Conf>,
}

impl Runtime {
    /// Parses the command line, loads and validates the configuration.
    ///
    /// Logging is not up yet at this point; call [`Runtime::log_notices`] once it is.
    pub fn new() -> Result<Self, RuntimeError> {
        let cli = Cli::parse();
        let (mut conf, cli) = Conf::new(cli)?;
        conf.validate()?;

        Ok(Runtime {
            cli,
            conf: Arc::new(conf),
        })
    }

    pub fn log_notices(&self) {
        for notice in &self.conf.notices {
            match notice {
                ConfNotice::DeprecatedAlias {
                    alias,
                    replaces,
                    value,
                } => info!(
                    event.name = "config.deprecated_option",
                    config.option = %alias,
                    config.replaces = %replaces,
                    config.value = %value,
                    "using deprecated option"
                ),
                ConfNotice::RttDisabled { direction } => warn!(
                    event.name = "config.rtt_disabled",
                    config.direction = ?direction,
                    "rtt calculation requires direction 'both', disabling it"
                ),
            }
        }
    }
}

/// Installs the global subscriber. File and line are added at DEBUG, thread ids
/// and names at TRACE.
pub fn init_tracing(log_level: Level) {
    let mut fmt_layer = Layer::new().with_ansi(std::env::var("NO_COLOR").is_err());

    match log_level {
        Level::DEBUG => fmt_layer = fmt_layer.with_file(true).with_line_number(true),
        Level::TRACE => {
            fmt_layer = fmt_layer
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        }
        _ => {}
    }

    let filter = EnvFilter::new(format!("warn,flowkeeper={log_level}"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    info!(
        event.name = "system.tracing_initialized",
        system.log_level = %log_level,
        "logging initialized"
    );
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
