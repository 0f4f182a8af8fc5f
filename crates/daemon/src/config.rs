//! Vessel configuration.
//!
//! Defaults are baked in at build time through `VESSEL_*` environment
//! variables so a build can ship with its identity and credentials. A TOML
//! file, then command line flags, override them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::bus::{Bus, BusError};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVICE_NAME: &str = "vessel";
const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),
    #[error("invalid server url {0:?}")]
    InvalidServer(String),
    #[error("no servers configured")]
    NoServers,
}

/// JWT and seed used to authenticate against the bus.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub jwt: String,
    pub seed: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("jwt", &"<redacted>")
            .field("seed", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VesselConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    #[serde(default = "default_credentials")]
    pub credentials: Option<Credentials>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Extra environment handed to scripts.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Register the `mem` scheme for scratch files.
    #[serde(default = "default_mem_scratch")]
    pub mem_scratch: bool,
}

impl Default for VesselConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            version: default_version(),
            description: None,
            servers: default_servers(),
            credentials: default_credentials(),
            request_timeout_secs: default_request_timeout_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            log_level: default_log_level(),
            env: BTreeMap::new(),
            mem_scratch: default_mem_scratch(),
        }
    }
}

impl VesselConfig {
    /// Directory holding the default config file, if the platform has one.
    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "vessel").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::default_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load `path` if given, else the default file when present, else the
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_path(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_path(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.service_name;
        if name.is_empty()
            || name
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
        {
            return Err(ConfigError::InvalidServiceName(name.clone()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        for server in &self.servers {
            let url =
                url::Url::parse(server).map_err(|_| ConfigError::InvalidServer(server.clone()))?;
            if !matches!(url.scheme(), "nats" | "tls" | "ws" | "wss") {
                return Err(ConfigError::InvalidServer(server.clone()));
            }
        }
        Ok(())
    }

    pub fn inbox_prefix(&self) -> String {
        common::protocol::inbox_prefix(&self.service_name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Connect to the configured bus.
    #[cfg(feature = "nats")]
    pub async fn connect(&self) -> Result<Arc<dyn Bus>, BusError> {
        let options = common::bus::NatsOptions {
            name: self.service_name.clone(),
            servers: self.servers.clone(),
            jwt: self.credentials.as_ref().map(|c| c.jwt.clone()),
            seed: self.credentials.as_ref().map(|c| c.seed.clone()),
            inbox_prefix: Some(self.inbox_prefix()),
            request_timeout: Some(self.request_timeout()),
        };
        let bus = common::bus::NatsBus::connect(&options).await?;
        Ok(Arc::new(bus))
    }

    #[cfg(not(feature = "nats"))]
    pub async fn connect(&self) -> Result<Arc<dyn Bus>, BusError> {
        Err(BusError::Connect(
            "built without the nats feature".to_string(),
        ))
    }
}

fn default_service_name() -> String {
    option_env!("VESSEL_SERVICE_NAME")
        .unwrap_or(DEFAULT_SERVICE_NAME)
        .to_string()
}

fn default_version() -> String {
    option_env!("VESSEL_SERVICE_VERSION")
        .unwrap_or(env!("CARGO_PKG_VERSION"))
        .to_string()
}

fn default_servers() -> Vec<String> {
    option_env!("VESSEL_SERVERS")
        .unwrap_or(DEFAULT_SERVER)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_credentials() -> Option<Credentials> {
    match (option_env!("VESSEL_JWT"), option_env!("VESSEL_SEED")) {
        (Some(jwt), Some(seed)) if !jwt.is_empty() && !seed.is_empty() => Some(Credentials {
            jwt: jwt.to_string(),
            seed: seed.to_string(),
        }),
        _ => None,
    }
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_sync_timeout_secs() -> u64 {
    DEFAULT_SYNC_TIMEOUT_SECS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_mem_scratch() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = VesselConfig::from_toml(
            r#"
            service_name = "agent-1"
            servers = ["nats://10.0.0.1:4222", "nats://10.0.0.2:4222"]

            [env]
            STAGE = "prod"
            "#,
        )
        .unwrap();
        assert_eq!(config.service_name, "agent-1");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.env["STAGE"], "prod");
        assert_eq!(config.sync_timeout(), Duration::from_secs(30));
        assert!(config.mem_scratch);
        assert_eq!(config.inbox_prefix(), "_INBOX_agent-1");
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let mut config = VesselConfig {
            service_name: "a.b".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidServiceName(_)
        ));

        config.service_name = "agent".to_string();
        config.servers = vec!["http://localhost".to_string()];
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidServer(_)
        ));

        config.servers.clear();
        assert!(matches!(config.validate().unwrap_err(), ConfigError::NoServers));
    }

    #[test]
    fn test_credentials_are_redacted() {
        let config = VesselConfig {
            credentials: Some(Credentials {
                jwt: "eyJ0eXAi".to_string(),
                seed: "SUAIBDPB".to_string(),
            }),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("eyJ0eXAi"));
        assert!(!debug.contains("SUAIBDPB"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "service_name = \"agent-7\"\nmem_scratch = false\n").unwrap();
        let config = VesselConfig::load(Some(&path)).unwrap();
        assert_eq!(config.service_name, "agent-7");
        assert!(!config.mem_scratch);

        std::fs::write(&path, "service_name = 7").unwrap();
        assert!(matches!(
            VesselConfig::load(Some(&path)).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
