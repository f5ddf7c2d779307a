use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf::conf_serde::level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "flowkeeper.yaml").
    #[arg(short, long, value_name = "FILE", env = "FLOWKEEPER_CONFIG_PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    /// Falls back to the configuration file, then to "info".
    #[arg(short, long, value_name = "LEVEL", env = "FLOWKEEPER_LOG_LEVEL")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "level::option"
    )]
    pub log_level: Option<Level>,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|jail| {
            jail.set_env("FLOWKEEPER_CONFIG_PATH", "/tmp/flowkeeper.yaml");
            jail.set_env("FLOWKEEPER_LOG_LEVEL", "debug");

            let args = [
                "flowkeeper",
                "--config",
                "/path/to/conf.yaml",
                "--log-level",
                "warn",
            ];
            let cli = Cli::parse_from(args);
            assert_eq!(cli.config, Some(PathBuf::from("/path/to/conf.yaml")));
            assert_eq!(cli.log_level, Some(Level::WARN));

            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("FLOWKEEPER_CONFIG_PATH", "/tmp/flowkeeper.yaml");
            jail.set_env("FLOWKEEPER_LOG_LEVEL", "debug");

            let cli = Cli::parse_from(["flowkeeper"]);
            assert_eq!(cli.config, Some(PathBuf::from("/tmp/flowkeeper.yaml")));
            assert_eq!(cli.log_level, Some(Level::DEBUG));

            Ok(())
        });
    }

    #[test]
    fn log_level_is_unset_without_flag_or_env() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["flowkeeper"]);
            assert_eq!(cli.log_level, None);
            assert_eq!(cli.config, None);

            Ok(())
        });
    }
}
