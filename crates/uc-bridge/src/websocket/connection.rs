//! Control-channel connection handling
//!
//! Authenticates the client, runs the receive loop and tears down the
//! subscriptions the connection created when it closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::registry::{Notify, SubscriptionId};
use crate::{BridgeError, BridgeState};

use super::dispatch::handle_message;
use super::types::{
    AuthInvalidMessage, AuthOkMessage, AuthRequiredMessage, IncomingMessage, OutgoingMessage,
};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Connection State
// =============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which subscription table a command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Entities,
    Configuration,
}

/// Per-connection state
pub struct ActiveConnection {
    pub state: BridgeState,
    id: u64,
    /// Last message ID received
    last_id: AtomicU64,
    /// Subscribe command id -> registry subscription
    subscriptions: Mutex<HashMap<u64, (SubscriptionId, SubscriptionKind)>>,
}

impl ActiveConnection {
    pub fn new(state: BridgeState) -> Self {
        Self {
            state,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            last_id: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Process-unique connection id; owns the flows the connection starts
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Validate that the message ID is increasing
    pub fn validate_id(&self, id: u64) -> Result<(), &'static str> {
        let last = self.last_id.load(Ordering::SeqCst);
        if id <= last {
            return Err("id_reuse");
        }
        self.last_id.store(id, Ordering::SeqCst);
        Ok(())
    }

    /// Tie a registry subscription to the command that created it
    pub fn bind(&self, message_id: u64, subscription: SubscriptionId, kind: SubscriptionKind) {
        self.subscriptions
            .lock()
            .insert(message_id, (subscription, kind));
    }

    /// Forget the subscription created by `message_id` if it is of `kind`
    pub fn release(&self, message_id: u64, kind: SubscriptionKind) -> Option<SubscriptionId> {
        let mut subscriptions = self.subscriptions.lock();
        match subscriptions.get(&message_id) {
            Some((_, bound)) if *bound == kind => {
                subscriptions.remove(&message_id).map(|(id, _)| id)
            }
            _ => None,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Abort the flows this connection started and unsubscribe everything
    /// it created
    ///
    /// Returns the number of subscriptions removed.
    pub fn close(&self) -> usize {
        let aborted = self.state.flows.abort_owned_by(self.id);
        if aborted > 0 {
            info!(connection = self.id, aborted, "Aborted flows of closed connection");
        }

        let subscriptions: Vec<_> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        let Some(registry) = self.state.integration.registry() else {
            return 0;
        };
        subscriptions
            .into_iter()
            .filter(|(id, kind)| match kind {
                SubscriptionKind::Entities => registry.unsubscribe_entities(*id),
                SubscriptionKind::Configuration => registry.unsubscribe_configuration(*id),
            })
            .count()
    }
}

/// Pushes registry events to one connection as `event` messages
pub struct ConnectionNotifier {
    message_id: u64,
    tx: mpsc::Sender<OutgoingMessage>,
}

impl ConnectionNotifier {
    pub fn new(message_id: u64, tx: mpsc::Sender<OutgoingMessage>) -> Self {
        Self { message_id, tx }
    }
}

impl Notify for ConnectionNotifier {
    fn notify(&self, payload: Value) -> Result<(), BridgeError> {
        self.tx
            .try_send(OutgoingMessage::event(self.message_id, payload))
            .map_err(|e| match e {
                TrySendError::Full(_) => BridgeError::ConnectionBusy,
                TrySendError::Closed(_) => BridgeError::ConnectionClosed,
            })
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// Handle a control-channel connection
pub async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let (mut sender, mut receiver) = socket.split();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let auth_required = OutgoingMessage::AuthRequired(AuthRequiredMessage {
        msg_type: "auth_required",
        ha_version: version.clone(),
    });
    if let Err(e) = send_message(&mut sender, &auth_required).await {
        error!("Failed to send auth_required: {}", e);
        return;
    }

    match tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth(&mut receiver)).await {
        Ok(Ok(token)) if state.token_accepted(token.as_deref()) => {
            let auth_ok = OutgoingMessage::AuthOk(AuthOkMessage {
                msg_type: "auth_ok",
                ha_version: version,
            });
            if let Err(e) = send_message(&mut sender, &auth_ok).await {
                error!("Failed to send auth_ok: {}", e);
                return;
            }
            info!("Control client authenticated");
        }
        Ok(Ok(_)) | Ok(Err(_)) => {
            let auth_invalid = OutgoingMessage::AuthInvalid(AuthInvalidMessage {
                msg_type: "auth_invalid",
                message: "Invalid access token or password".to_string(),
            });
            let _ = send_message(&mut sender, &auth_invalid).await;
            warn!("Control client authentication failed");
            return;
        }
        Err(_) => {
            let auth_invalid = OutgoingMessage::AuthInvalid(AuthInvalidMessage {
                msg_type: "auth_invalid",
                message: "Authentication timeout".to_string(),
            });
            let _ = send_message(&mut sender, &auth_invalid).await;
            warn!("Control client authentication timeout");
            return;
        }
    }

    let conn = Arc::new(ActiveConnection::new(state));
    let (tx, mut rx) = mpsc::channel::<OutgoingMessage>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if send_message(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Control channel received: {}", text);
                if let Err(e) = handle_message(&conn, &text, &tx).await {
                    error!("Error handling message: {}", e);
                }
            }
            Ok(Message::Close(_)) => {
                info!("Control client disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    let closed = conn.close();
    send_task.abort();
    info!(subscriptions = closed, "Control connection closed");
}

// =============================================================================
// Authentication
// =============================================================================

/// Wait for the auth message and return the credential it carried
async fn wait_for_auth(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> Result<Option<String>, String> {
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Ok(msg) = serde_json::from_str::<IncomingMessage>(&text) {
                    return match msg {
                        IncomingMessage::Auth {
                            access_token,
                            api_password,
                        } => Ok(access_token.or(api_password)),
                        _ => Err("Expected auth message".to_string()),
                    };
                }
            }
            Ok(Message::Close(_)) => {
                return Err("Connection closed".to_string());
            }
            Err(e) => {
                return Err(format!("WebSocket error: {}", e));
            }
            _ => {}
        }
    }
    Err("Connection closed".to_string())
}

/// Send a message to the WebSocket
pub async fn send_message(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &OutgoingMessage,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    debug!("Sending: {}", json);
    sender
        .send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
