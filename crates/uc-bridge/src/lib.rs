//! Bridge between Unfolded Circle remotes and the entity state store
//!
//! Remotes connect to the control channel and subscribe to the entities
//! they show. The [`registry`] keeps those subscriptions and forwards state
//! changes to them; [`reconcile`] tracks which entities each remote was
//! granted; [`selection`] negotiates a new entity list with the user and
//! pushes it to the remote.

pub mod api;
pub mod flow;
pub mod integration;
pub mod reconcile;
pub mod registry;
pub mod selection;
pub mod websocket;

mod error;

use std::sync::Arc;

use uc_hass::StateStore;

pub use api::{create_router, start_server};
pub use error::BridgeError;
pub use flow::{FlowManager, FlowResult};
pub use integration::{Integration, RemoteCoordinator};
pub use reconcile::{compute_delta, ClientEntityRegistry, EntityDelta};
pub use registry::{
    Notify, Subscription, SubscriptionId, SubscriptionRegistry, SubscriptionRequest,
};

/// Shared state of the HTTP and control-channel handlers
#[derive(Clone)]
pub struct BridgeState {
    pub integration: Arc<Integration>,
    pub flows: Arc<FlowManager>,
    /// Tokens accepted on the control channel; empty accepts any token
    pub access_tokens: Arc<Vec<String>>,
}

impl BridgeState {
    pub fn new(integration: Arc<Integration>, access_tokens: Vec<String>) -> Self {
        Self {
            flows: Arc::new(FlowManager::new(Arc::clone(&integration))),
            integration,
            access_tokens: Arc::new(access_tokens),
        }
    }

    pub fn states(&self) -> &Arc<StateStore> {
        self.integration.states()
    }

    pub fn token_accepted(&self, token: Option<&str>) -> bool {
        match token.filter(|t| !t.is_empty()) {
            None => false,
            Some(_) if self.access_tokens.is_empty() => true,
            Some(token) => self.access_tokens.iter().any(|t| t == token),
        }
    }
}
