//! Control-channel message types

use serde::{Deserialize, Serialize};

use crate::registry::SubscriptionRequest;

// =============================================================================
// Incoming Messages
// =============================================================================

/// Incoming message from a remote or a configuring client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    Auth {
        access_token: Option<String>,
        #[serde(default)]
        api_password: Option<String>,
    },
    Ping {
        id: u64,
    },
    #[serde(rename = "unfoldedcircle/info")]
    Info {
        id: u64,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "unfoldedcircle/entities/states")]
    EntitiesStates {
        id: u64,
        #[serde(default)]
        data: ClientData,
    },
    #[serde(rename = "unfoldedcircle/event/entities/subscribe")]
    SubscribeEntities {
        id: u64,
        #[serde(default)]
        data: ClientData,
    },
    #[serde(rename = "unfoldedcircle/event/entities/unsubscribe")]
    UnsubscribeEntities {
        id: u64,
        #[serde(default)]
        data: UnsubscribeData,
    },
    #[serde(rename = "unfoldedcircle/event/configure/subscribe")]
    SubscribeConfiguration {
        id: u64,
        #[serde(default)]
        data: ClientData,
    },
    #[serde(rename = "unfoldedcircle/event/configure/unsubscribe")]
    UnsubscribeConfiguration {
        id: u64,
        #[serde(default)]
        data: UnsubscribeData,
    },
    #[serde(rename = "config_entries/flow")]
    ConfigEntriesFlow {
        id: u64,
        /// Integration domain to start the flow for
        handler: String,
        /// Remote name or host; optional with a single remote
        #[serde(default)]
        remote: Option<String>,
    },
    #[serde(rename = "config_entries/flow/progress")]
    ConfigEntriesFlowProgress {
        id: u64,
        /// Flow to continue; `None` lists the flows in progress
        #[serde(default)]
        flow_id: Option<String>,
        #[serde(default)]
        user_input: Option<serde_json::Value>,
    },
    #[serde(rename = "config_entries/flow/abort")]
    ConfigEntriesFlowAbort {
        id: u64,
        flow_id: String,
    },
}

/// What a remote sends along with its commands
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientData {
    #[serde(default, alias = "entity_ids")]
    pub entities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ClientData {
    /// Subscription request; a remote that sends no `client_id` registers
    /// as unidentified
    pub fn subscription_request(&self) -> SubscriptionRequest {
        let client_id = self.client_id.clone().unwrap_or_default();
        SubscriptionRequest::new(client_id, self.driver_id.clone().unwrap_or_default())
            .with_version(self.version.clone().unwrap_or_default())
            .with_entities(self.entities.iter().cloned())
    }
}

/// Unsubscribe payload
///
/// Without `subscription_id` the subscription created by the command with
/// the same message id is meant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnsubscribeData {
    #[serde(default)]
    pub subscription_id: Option<u64>,
}

// =============================================================================
// Outgoing Messages
// =============================================================================

/// Outgoing message to a client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    AuthRequired(AuthRequiredMessage),
    AuthOk(AuthOkMessage),
    AuthInvalid(AuthInvalidMessage),
    Pong(PongMessage),
    Result(ResultMessage),
    Event(EventMessage),
}

impl OutgoingMessage {
    pub fn success(id: u64, result: Option<serde_json::Value>) -> Self {
        OutgoingMessage::Result(ResultMessage {
            id,
            msg_type: "result",
            success: true,
            result,
            error: None,
        })
    }

    pub fn error(id: u64, code: &str, message: impl Into<String>) -> Self {
        OutgoingMessage::Result(ResultMessage {
            id,
            msg_type: "result",
            success: false,
            result: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.into(),
            }),
        })
    }

    pub fn event(id: u64, event: serde_json::Value) -> Self {
        OutgoingMessage::Event(EventMessage {
            id,
            msg_type: "event",
            event,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct AuthRequiredMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub ha_version: String,
}

#[derive(Debug, Serialize)]
pub struct AuthOkMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub ha_version: String,
}

#[derive(Debug, Serialize)]
pub struct AuthInvalidMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct PongMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ResultMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct EventMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event: serde_json::Value,
}
