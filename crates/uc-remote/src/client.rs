//! The narrow device interface the bridge depends on

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Driver identifier prefix of the Home Assistant driver on the remote
pub const HASS_DRIVER_PREFIX: &str = "hass";

/// One integration instance configured on the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationInstance {
    pub integration_id: String,
    pub driver_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub device_state: Option<String>,
    #[serde(default)]
    pub name: Option<serde_json::Value>,
}

impl IntegrationInstance {
    /// Whether the instance belongs to a Home Assistant driver
    pub fn is_hass_driver(&self) -> bool {
        is_hass_driver(&self.driver_id)
    }
}

pub fn is_hass_driver(driver_id: &str) -> bool {
    driver_id.starts_with(HASS_DRIVER_PREFIX)
}

/// An entity exposed by an integration on the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEntity {
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub name: Option<serde_json::Value>,
}

/// Network details reported by the remote
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiInfo {
    /// MAC address
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Operations the bridge performs against a remote
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_remote_integrations(&self) -> Result<Vec<IntegrationInstance>>;

    /// Entities of one integration, optionally forcing the remote to reload
    /// them from the driver first
    async fn get_remote_integration_entities(
        &self,
        integration_id: &str,
        force_refresh: bool,
    ) -> Result<Vec<IntegrationEntity>>;

    /// Configure which entities of an integration the remote uses; an empty
    /// list means all of them
    async fn set_remote_integration_entities(
        &self,
        integration_id: &str,
        entity_ids: &[String],
    ) -> Result<()>;

    async fn get_remote_wifi_info(&self) -> Result<WifiInfo>;

    /// Last IP address learned from the remote, if any
    fn ip_address(&self) -> Option<String>;

    /// Host the client was configured with
    fn hostname(&self) -> &str;

    fn name(&self) -> &str;
}
