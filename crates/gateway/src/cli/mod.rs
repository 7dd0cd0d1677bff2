pub mod config;
pub mod doctor;

use clap::{Parser, Subcommand};

/// The session orchestrator daemon.
#[derive(Debug, Parser)]
#[command(name = "serialagent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway daemon (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any issues by severity.
    Validate,
    /// Dump the resolved configuration (with defaults) as YAML.
    Show,
}

/// Load configuration from the path named by `SA_CONFIG`, defaulting to
/// `config.local.yaml` (§6 "Environment / config", teacher precedent: the
/// original `assistant/config.py` `LOCAL_CONFIG_FILE` convention). A
/// missing file is not an error by itself — struct defaults plus
/// `Config::validate()`'s required-field check decide that.
pub fn load_config() -> anyhow::Result<(sa_domain::config::Config, String)> {
    let config_path = std::env::var("SA_CONFIG").unwrap_or_else(|_| "config.local.yaml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        serde_yaml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        sa_domain::config::Config::default()
    };

    Ok((config, config_path))
}
