//! REST client for the remote's core API

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::client::{IntegrationEntity, IntegrationInstance, RemoteClient, WifiInfo};
use crate::{RemoteError, Result};

/// Username for PIN based basic authentication
pub const AUTH_USERNAME: &str = "web-configurator";

/// Connection parameters for one remote
///
/// ```
/// use uc_remote::RemoteConfig;
/// use std::time::Duration;
///
/// let config = RemoteConfig::new("192.168.1.20")
///     .with_name("Living room")
///     .with_api_key("secret")
///     .with_timeout(Duration::from_secs(3));
/// assert_eq!(config.base_url(), "http://192.168.1.20/api");
/// ```
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    host: String,
    name: Option<String>,
    api_key: Option<String>,
    pin: Option<String>,
    timeout: Duration,
}

impl RemoteConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: None,
            api_key: None,
            pin: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Authenticate with a bearer API key (takes precedence over the PIN)
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Base URL of the REST API, without a trailing slash
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let root = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        if root.ends_with("/api") {
            root
        } else {
            format!("{root}/api")
        }
    }

    /// URL of the push socket derived from the REST base URL
    pub fn socket_url(&self) -> String {
        let base = self.base_url();
        let root = base.trim_end_matches("/api");
        let root = root
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{root}/ws")
    }

    pub fn into_client(self) -> Result<HttpRemote> {
        if self.host.trim().is_empty() {
            return Err(RemoteError::InvalidUrl(self.host));
        }
        let client = Client::builder().timeout(self.timeout).build()?;
        let base_url = self.base_url();
        Ok(HttpRemote {
            base_url,
            client,
            name: self.name.clone().unwrap_or_else(|| self.host.clone()),
            config: self,
            ip_address: RwLock::new(None),
        })
    }
}

/// Version details served without authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub core: Option<String>,
}

/// Hardware details of the remote
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub hw_revision: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct EntitySelection<'a> {
    entity_ids: &'a [String],
}

/// reqwest backed [`RemoteClient`]
#[derive(Debug)]
pub struct HttpRemote {
    base_url: String,
    client: Client,
    name: String,
    config: RemoteConfig,
    ip_address: RwLock<Option<String>>,
}

impl HttpRemote {
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        if let Some(api_key) = &self.config.api_key {
            request.bearer_auth(api_key)
        } else if let Some(pin) = &self.config.pin {
            request.basic_auth(AUTH_USERNAME, Some(pin))
        } else {
            request
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Authentication);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or(body);
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.authorize(self.client.get(self.url(path))).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Version information; this endpoint needs no credentials
    pub async fn get_version(&self) -> Result<VersionInfo> {
        let response = self
            .client
            .get(self.url("pub/version"))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn get_remote_information(&self) -> Result<SystemInfo> {
        self.get_json("system").await
    }

    /// Check the remote is reachable and accepts the credentials
    #[instrument(skip(self), fields(remote = %self.name))]
    pub async fn validate_connection(&self) -> Result<VersionInfo> {
        let version = self.get_version().await?;
        self.get_remote_information().await?;
        debug!(api = ?version.api, "Remote connection validated");
        Ok(version)
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn get_remote_integrations(&self) -> Result<Vec<IntegrationInstance>> {
        self.get_json("intg/instances").await
    }

    #[instrument(skip(self), fields(remote = %self.name))]
    async fn get_remote_integration_entities(
        &self,
        integration_id: &str,
        force_refresh: bool,
    ) -> Result<Vec<IntegrationEntity>> {
        let mut path = format!("intg/instances/{integration_id}/entities");
        if force_refresh {
            path.push_str("?reload=true");
        }
        self.get_json(&path).await
    }

    #[instrument(skip(self, entity_ids), fields(remote = %self.name, count = entity_ids.len()))]
    async fn set_remote_integration_entities(
        &self,
        integration_id: &str,
        entity_ids: &[String],
    ) -> Result<()> {
        let url = self.url(&format!("intg/instances/{integration_id}/entities"));
        let response = self
            .authorize(self.client.post(url))
            .json(&EntitySelection { entity_ids })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_remote_wifi_info(&self) -> Result<WifiInfo> {
        let info: WifiInfo = self.get_json("system/wifi").await?;
        if let Some(ip) = &info.ip_address {
            *self.ip_address.write() = Some(ip.clone());
        }
        Ok(info)
    }

    fn ip_address(&self) -> Option<String> {
        self.ip_address.read().clone()
    }

    fn hostname(&self) -> &str {
        &self.config.host
    }

    fn name(&self) -> &str {
        &self.name
    }
}
