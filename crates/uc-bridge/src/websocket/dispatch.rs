//! Control-channel message dispatch
//!
//! Routes incoming messages to the appropriate handler.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::connection::{ActiveConnection, SubscriptionKind};
use super::handlers;
use super::types::{IncomingMessage, OutgoingMessage, PongMessage};

/// Handle an incoming message
pub async fn handle_message(
    conn: &Arc<ActiveConnection>,
    text: &str,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let msg: IncomingMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(msg_type) = json.get("type").and_then(|t| t.as_str()) {
                    warn!("Unhandled message type: {}", msg_type);
                }
            }
            return Err(format!("Invalid message format: {}", e));
        }
    };

    match msg {
        IncomingMessage::Auth { .. } => {
            // Already authenticated
            Ok(())
        }
        IncomingMessage::Ping { id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            let pong = OutgoingMessage::Pong(PongMessage {
                id,
                msg_type: "pong",
            });
            tx.send(pong).await.map_err(|e| e.to_string())
        }
        IncomingMessage::Info { id, data, message } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_info(id, message, data, tx).await
        }
        IncomingMessage::EntitiesStates { id, data } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_entities_states(conn, id, &data, tx).await
        }
        IncomingMessage::SubscribeEntities { id, data } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_subscribe_entities(conn, id, &data, tx).await
        }
        IncomingMessage::UnsubscribeEntities { id, data } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_unsubscribe(conn, id, &data, SubscriptionKind::Entities, tx).await
        }
        IncomingMessage::SubscribeConfiguration { id, data } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_subscribe_configuration(conn, id, &data, tx).await
        }
        IncomingMessage::UnsubscribeConfiguration { id, data } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_unsubscribe(conn, id, &data, SubscriptionKind::Configuration, tx).await
        }
        IncomingMessage::ConfigEntriesFlow {
            id,
            handler,
            remote,
        } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_config_entries_flow(conn, id, &handler, remote.as_deref(), tx).await
        }
        IncomingMessage::ConfigEntriesFlowProgress {
            id,
            flow_id,
            user_input,
        } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            match flow_id {
                Some(ref fid) => {
                    handlers::handle_config_entries_flow_progress(conn, id, fid, user_input, tx)
                        .await
                }
                None => handlers::handle_config_entries_flow_progress_list(conn, id, tx).await,
            }
        }
        IncomingMessage::ConfigEntriesFlowAbort { id, flow_id } => {
            conn.validate_id(id).map_err(|e| e.to_string())?;
            handlers::handle_config_entries_flow_abort(conn, id, &flow_id, tx).await
        }
    }
}
