//! Integration lifecycle
//!
//! [`Integration::setup`] creates the subscription registry and starts the
//! push sockets of the configured remotes; [`Integration::unload`] closes
//! every subscription and stops the sockets again. Between the two, the
//! control-channel handlers and the selection flows reach the registry
//! through [`Integration::registry`].

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uc_config::RemoteSettings;
use uc_hass::{StateChangeTracker, StateStore};
use uc_remote::{
    RemoteClient, RemoteConfig, RemoteError, RemoteEventSocket, ResumeCallback, SocketConfig,
};

use crate::reconcile::ClientEntityRegistry;
use crate::registry::{same_client, SubscriptionRegistry};
use crate::selection::{
    EntitySelectionFlow, SelectionContext, SelectionOptions, SelectionOutcome, SelectionTiming,
};
use crate::BridgeError;

/// One configured remote: its client, its push socket and the options the
/// last selection stored
pub struct RemoteCoordinator {
    client: Arc<dyn RemoteClient>,
    socket: Option<Arc<RemoteEventSocket>>,
    options: RwLock<SelectionOptions>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteCoordinator {
    pub fn new(client: Arc<dyn RemoteClient>, options: SelectionOptions) -> Self {
        Self {
            client,
            socket: None,
            options: RwLock::new(options),
            task: Mutex::new(None),
        }
    }

    /// Attach a push socket; each reconnect refreshes the remote's network
    /// info
    #[must_use]
    pub fn with_socket(mut self, socket: Arc<RemoteEventSocket>) -> Self {
        let client = Arc::clone(&self.client);
        let refresh: ResumeCallback = Arc::new(move || {
            let client = Arc::clone(&client);
            Box::pin(async move {
                match client.get_remote_wifi_info().await {
                    Ok(info) => debug!(ip_address = ?info.ip_address, "Refreshed remote after resume"),
                    Err(e) => warn!(remote = client.name(), error = %e, "Refresh after resume failed"),
                }
            })
        });
        socket.on_resume(refresh);
        self.socket = Some(socket);
        self
    }

    /// Build the HTTP client and, when an API key is configured, the push
    /// socket of a remote
    pub fn from_settings(settings: &RemoteSettings) -> Result<Self, RemoteError> {
        let mut config = RemoteConfig::new(&settings.host);
        if let Some(name) = &settings.name {
            config = config.with_name(name);
        }
        if let Some(pin) = &settings.pin {
            config = config.with_pin(pin);
        }
        if let Some(api_key) = &settings.api_key {
            config = config.with_api_key(api_key);
        }

        let socket = config.api_key().map(|api_key| {
            let mut socket_config = SocketConfig::new(config.socket_url(), api_key);
            if !settings.channels.is_empty() {
                socket_config = socket_config.with_channels(settings.channels.clone());
            }
            RemoteEventSocket::new(socket_config)
        });

        let options = SelectionOptions {
            available_entities: settings.available_entities.clone(),
            client_id: settings.client_id.clone(),
        };
        let coordinator = Self::new(Arc::new(config.into_client()?), options);
        Ok(match socket {
            Some(socket) => coordinator.with_socket(socket),
            None => coordinator,
        })
    }

    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }

    pub fn socket(&self) -> Option<&Arc<RemoteEventSocket>> {
        self.socket.as_ref()
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn options(&self) -> SelectionOptions {
        self.options.read().clone()
    }

    /// Whether `key` names this remote, by name or by host
    pub fn matches(&self, key: &str) -> bool {
        self.client.name() == key || same_client(self.client.hostname(), key)
    }

    /// Store the result of a finished selection
    pub fn record(&self, outcome: &SelectionOutcome) {
        if let SelectionOutcome::Applied {
            client_id,
            available_entities,
        } = outcome
        {
            let mut options = self.options.write();
            options.client_id = Some(client_id.clone());
            options.available_entities = available_entities.clone();
            info!(
                remote = self.client.name(),
                client_id = %client_id,
                entities = available_entities.len(),
                "Stored entity selection"
            );
        }
    }

    fn start(&self) {
        let Some(socket) = &self.socket else {
            debug!(remote = self.client.name(), "No API key, push socket disabled");
            return;
        };

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(socket.spawn());
        info!(remote = self.client.name(), "Push socket started");
    }

    fn stop(&self) {
        if let Some(socket) = &self.socket {
            socket.shutdown();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Owner of everything the bridge sets up for its remotes
pub struct Integration {
    states: Arc<StateStore>,
    client_entities: Arc<ClientEntityRegistry>,
    registry: RwLock<Option<Arc<SubscriptionRegistry>>>,
    remotes: Vec<Arc<RemoteCoordinator>>,
    timing: SelectionTiming,
}

impl Integration {
    pub fn new(
        states: Arc<StateStore>,
        remotes: Vec<Arc<RemoteCoordinator>>,
        timing: SelectionTiming,
    ) -> Self {
        Self {
            states,
            client_entities: Arc::new(ClientEntityRegistry::new()),
            registry: RwLock::new(None),
            remotes,
            timing,
        }
    }

    /// Create the registry and start the push sockets
    ///
    /// Calling it again while set up returns the existing registry.
    pub fn setup(&self) -> Arc<SubscriptionRegistry> {
        let mut slot = self.registry.write();
        if let Some(registry) = slot.as_ref() {
            return Arc::clone(registry);
        }

        let tracker: Arc<dyn StateChangeTracker> = self.states.clone();
        let registry = Arc::new(SubscriptionRegistry::new(tracker));
        *slot = Some(Arc::clone(&registry));
        drop(slot);

        for remote in &self.remotes {
            remote.start();
        }
        info!(remotes = self.remotes.len(), "Integration set up");
        registry
    }

    /// Close every subscription and stop the push sockets
    ///
    /// Returns the number of subscriptions closed.
    pub fn unload(&self) -> usize {
        let Some(registry) = self.registry.write().take() else {
            return 0;
        };
        for remote in &self.remotes {
            remote.stop();
        }
        let closed = registry.close_all();
        info!(closed, "Integration unloaded");
        closed
    }

    pub fn registry(&self) -> Option<Arc<SubscriptionRegistry>> {
        self.registry.read().clone()
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn client_entities(&self) -> &Arc<ClientEntityRegistry> {
        &self.client_entities
    }

    pub fn remotes(&self) -> &[Arc<RemoteCoordinator>] {
        &self.remotes
    }

    /// Remote named by `key`, or the only remote when `key` is `None`
    pub fn remote(&self, key: Option<&str>) -> Option<Arc<RemoteCoordinator>> {
        match key {
            Some(key) => self.remotes.iter().find(|r| r.matches(key)).cloned(),
            None if self.remotes.len() == 1 => self.remotes.first().cloned(),
            None => None,
        }
    }

    /// Start an entity selection for a remote
    ///
    /// The finished selection is stored on the remote's coordinator.
    pub fn selection_flow(&self, key: Option<&str>) -> Result<EntitySelectionFlow, BridgeError> {
        let registry = self.registry().ok_or(BridgeError::NotSetUp)?;
        let remote = self
            .remote(key)
            .ok_or_else(|| BridgeError::UnknownRemote(key.unwrap_or_default().to_string()))?;

        let ctx = SelectionContext {
            remote: Arc::clone(remote.client()),
            registry,
            states: Arc::clone(&self.states),
            client_entities: Arc::clone(&self.client_entities),
            timing: self.timing,
            options: remote.options(),
        };
        let coordinator = Arc::clone(&remote);
        Ok(EntitySelectionFlow::new(
            ctx,
            Box::new(move |outcome| coordinator.record(outcome)),
        ))
    }
}
