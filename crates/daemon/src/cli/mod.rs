use std::path::PathBuf;

use clap::Parser;

use vessel_daemon::{ConfigError, VesselConfig};

pub mod op;
pub mod ops;

pub use op::{Op, OpContext};

crate::command_enum! {
    (Daemon, ops::Daemon),
    (Bundle, ops::Bundle),
    (Worker, ops::Worker),
    (Repo, ops::Repo),
    (Version, ops::Version),
}

#[derive(Parser, Debug)]
#[command(name = "vessel", about = "Remote script execution agent", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "VESSEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Service name of the vessel
    #[arg(long, global = true, env = "VESSEL_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Bus server URL; may be repeated
    #[arg(long = "server", global = true, env = "VESSEL_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Config file contents with command-line overrides applied.
    pub fn load_config(&self) -> Result<VesselConfig, ConfigError> {
        let mut config = VesselConfig::load(self.config.as_deref())?;
        if let Some(name) = &self.service_name {
            config.service_name = name.clone();
        }
        if !self.servers.is_empty() {
            config.servers = self.servers.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
