//! Typed bridge configuration

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use uc_core::EntityId;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;

pub const CONFIG_FILE: &str = "configuration.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub selection: SelectionConfig,
    pub remotes: Vec<RemoteSettings>,
    pub entities: Vec<EntitySeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Tokens accepted on the control channel; empty accepts any token
    pub access_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8123)),
            access_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Timings of the entity selection flow
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub settle_delay_ms: u64,
}

impl SelectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_attempts: 10,
            settle_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    pub name: Option<String>,
    pub host: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    /// Entities already made available to this remote
    #[serde(default)]
    pub available_entities: BTreeSet<String>,
    /// Client identifier recorded by the last selection
    #[serde(default)]
    pub client_id: Option<String>,
    /// Push socket channels
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Initial state written into the store at startup
#[derive(Debug, Clone, Deserialize)]
pub struct EntitySeed {
    pub entity_id: EntityId,
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl BridgeConfig {
    /// Load `configuration.yaml` from `config_dir`
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let mut loader = YamlLoader::new(config_dir)?;
        let path = config_dir.join(CONFIG_FILE);
        let value = loader.load_file(&path)?;
        let config = Self::from_value(value)?;
        info!(
            remotes = config.remotes.len(),
            entities = config.entities.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_value(value: serde_yaml::Value) -> ConfigResult<Self> {
        let config: Self = match value {
            serde_yaml::Value::Null => Self::default(),
            value => serde_yaml::from_value(value).map_err(|e| ConfigError::ValidationFailed {
                message: e.to_string(),
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.selection.poll_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "selection.poll_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for (index, remote) in self.remotes.iter().enumerate() {
            if remote.host.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("remotes[{index}].host"),
                    reason: "must not be empty".to_string(),
                });
            }
            if remote.api_key.is_none() && remote.pin.is_none() {
                return Err(ConfigError::ValidationFailed {
                    message: format!("remote '{}' needs an api_key or a pin", remote.host),
                });
            }
        }
        Ok(())
    }
}
