//! Configuration for the remote bridge
//!
//! `configuration.yaml` is read from a config directory. Values may use
//! `!secret key` (looked up in `secrets.yaml`), `!env_var NAME [default]`
//! and `!include file.yaml`. The resolved document is deserialized into
//! [`BridgeConfig`].

mod error;
mod loader;
mod secrets;
mod settings;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::Secrets;
pub use settings::{
    BridgeConfig, EntitySeed, LoggingConfig, RemoteSettings, SelectionConfig, ServerConfig,
    CONFIG_FILE,
};
