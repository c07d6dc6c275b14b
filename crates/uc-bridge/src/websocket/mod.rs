//! Control channel
//!
//! Remotes talk to the bridge over a Home Assistant style websocket:
//! `auth_required` / `auth` / `auth_ok`, then `result` replies and `event`
//! pushes that echo the id of the command they belong to.
//!
//! - `types` - incoming and outgoing message types
//! - `connection` - authentication and connection lifecycle
//! - `dispatch` - message routing to handlers
//! - `handlers` - individual command handlers

mod connection;
mod dispatch;
mod handlers;
mod types;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use crate::BridgeState;

pub use connection::{handle_socket, ActiveConnection, ConnectionNotifier, SubscriptionKind};
pub use dispatch::handle_message;
pub use types::{
    AuthInvalidMessage, AuthOkMessage, AuthRequiredMessage, ClientData, ErrorInfo, EventMessage,
    IncomingMessage, OutgoingMessage, PongMessage, ResultMessage, UnsubscribeData,
};

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_message() {
        let json = r#"{"type": "auth", "access_token": "token"}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::Auth { access_token, .. } => {
                assert_eq!(access_token, Some("token".to_string()));
            }
            _ => panic!("Expected Auth message"),
        }
    }

    #[test]
    fn test_parse_subscribe_with_entity_alias() {
        let json = r#"{
            "type": "unfoldedcircle/event/entities/subscribe",
            "id": 3,
            "data": {
                "entity_ids": ["light.x", "switch.y"],
                "client_id": "192.168.1.20",
                "driver_id": "hass",
                "version": "1.0.0"
            }
        }"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::SubscribeEntities { id, data } => {
                assert_eq!(id, 3);
                let request = data.subscription_request();
                assert_eq!(request.client_id, "192.168.1.20");
                assert_eq!(request.driver_id, "hass");
                assert_eq!(request.protocol_version, "1.0.0");
                assert_eq!(request.entity_ids.len(), 2);
            }
            _ => panic!("Expected SubscribeEntities message"),
        }
    }

    #[test]
    fn test_parse_states_without_data() {
        let json = r#"{"type": "unfoldedcircle/entities/states", "id": 4}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::EntitiesStates { id, data } => {
                assert_eq!(id, 4);
                assert!(data.entities.is_empty());
                assert!(data.client_id.is_none());
            }
            _ => panic!("Expected EntitiesStates message"),
        }
    }

    #[test]
    fn test_parse_unsubscribe() {
        let json = r#"{"type": "unfoldedcircle/event/configure/unsubscribe", "id": 9, "data": {"subscription_id": 5}}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::UnsubscribeConfiguration { id, data } => {
                assert_eq!(id, 9);
                assert_eq!(data.subscription_id, Some(5));
            }
            _ => panic!("Expected UnsubscribeConfiguration message"),
        }
    }

    #[test]
    fn test_serialize_event() {
        let msg = OutgoingMessage::event(7, serde_json::json!({"data": []}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["data"], serde_json::json!([]));
    }

    #[test]
    fn test_serialize_error_result() {
        let msg = OutgoingMessage::error(2, "flow_error", "boom");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "flow_error");
        assert!(json.get("result").is_none());
    }
}
