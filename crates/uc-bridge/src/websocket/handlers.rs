//! Control-channel command handlers

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::connection::{ActiveConnection, ConnectionNotifier, SubscriptionKind};
use super::types::{ClientData, OutgoingMessage, UnsubscribeData};
use crate::flow::FlowResult;
use crate::registry::Notify;

/// Handle unfoldedcircle/info - liveness check
pub async fn handle_info(
    id: u64,
    message: Option<String>,
    data: Option<Value>,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let result = json!({
        "state": "CONNECTED",
        "cat": "DEVICE",
        "version": env!("CARGO_PKG_VERSION"),
        "message": message,
        "data": data,
    });
    tx.send(OutgoingMessage::success(id, Some(result)))
        .await
        .map_err(|e| e.to_string())
}

/// Handle unfoldedcircle/entities/states
///
/// Without entity ids every known state is returned. Otherwise the ids are
/// granted to the announcing client and their states returned; unknown ids
/// are left out.
pub async fn handle_entities_states(
    conn: &Arc<ActiveConnection>,
    id: u64,
    data: &ClientData,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let states = conn.state.states();
    let result = if data.entities.is_empty() {
        states.all()
    } else {
        if let Some(client_id) = data.client_id.as_deref().filter(|c| !c.is_empty()) {
            conn.state
                .integration
                .client_entities()
                .reconcile(client_id, &data.entities);
        }
        states.get_many(data.entities.iter().map(String::as_str))
    };
    debug!(id, count = result.len(), "Returning entity states");

    let result = serde_json::to_value(&result).map_err(|e| e.to_string())?;
    tx.send(OutgoingMessage::success(id, Some(result)))
        .await
        .map_err(|e| e.to_string())
}

/// Handle unfoldedcircle/event/entities/subscribe
pub async fn handle_subscribe_entities(
    conn: &Arc<ActiveConnection>,
    id: u64,
    data: &ClientData,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let Some(registry) = conn.state.integration.registry() else {
        warn!(id, "Entity subscribe while the integration is not set up");
        return send_empty(id, tx).await;
    };

    let request = data.subscription_request();
    let client_id = request.client_id.clone();
    let notify: Arc<dyn Notify> = Arc::new(ConnectionNotifier::new(id, tx.clone()));
    let subscription = registry.register_entities_subscription(request, notify);
    conn.bind(id, subscription, SubscriptionKind::Entities);

    if !client_id.is_empty() {
        conn.state
            .integration
            .client_entities()
            .reconcile(&client_id, &data.entities);
    }
    info!(
        id,
        subscription = %subscription,
        client_id = %client_id,
        entities = data.entities.len(),
        "Remote subscribed to entity events"
    );
    send_empty(id, tx).await
}

/// Handle unfoldedcircle/event/configure/subscribe
pub async fn handle_subscribe_configuration(
    conn: &Arc<ActiveConnection>,
    id: u64,
    data: &ClientData,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let Some(registry) = conn.state.integration.registry() else {
        warn!(id, "Configuration subscribe while the integration is not set up");
        return send_empty(id, tx).await;
    };

    let notify: Arc<dyn Notify> = Arc::new(ConnectionNotifier::new(id, tx.clone()));
    let subscription = registry.register_configuration_subscription(data.subscription_request(), notify);
    conn.bind(id, subscription, SubscriptionKind::Configuration);
    info!(id, subscription = %subscription, "Remote subscribed to configuration events");
    send_empty(id, tx).await
}

/// Handle the unsubscribe commands of both subscription kinds
///
/// Unknown or already removed subscriptions are answered with success.
pub async fn handle_unsubscribe(
    conn: &Arc<ActiveConnection>,
    id: u64,
    data: &UnsubscribeData,
    kind: SubscriptionKind,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let Some(registry) = conn.state.integration.registry() else {
        warn!(id, ?kind, "Unsubscribe while the integration is not set up");
        return send_empty(id, tx).await;
    };

    let key = data.subscription_id.unwrap_or(id);
    match conn.release(key, kind) {
        Some(subscription) => {
            let removed = match kind {
                SubscriptionKind::Entities => registry.unsubscribe_entities(subscription),
                SubscriptionKind::Configuration => registry.unsubscribe_configuration(subscription),
            };
            info!(id, ?kind, subscription = %subscription, removed, "Remote unsubscribed");
        }
        None => debug!(id, ?kind, key, "Nothing to unsubscribe"),
    }
    send_empty(id, tx).await
}

/// Handle config_entries/flow - start an entity selection
///
/// The flow is created right away and tied to the connection; its first
/// step runs in a task so the connection keeps serving other commands.
pub async fn handle_config_entries_flow(
    conn: &Arc<ActiveConnection>,
    id: u64,
    handler: &str,
    remote: Option<&str>,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    info!("Starting config flow for handler: {}", handler);

    let flows = Arc::clone(&conn.state.flows);
    let flow_id = match flows.create_flow(handler, remote, Some(conn.id())) {
        Ok(flow_id) => flow_id,
        Err(e) => {
            error!("Failed to start config flow: {}", e);
            return tx
                .send(OutgoingMessage::error(id, "flow_error", e))
                .await
                .map_err(|e| e.to_string());
        }
    };

    let tx = tx.clone();
    tokio::spawn(async move {
        let result = flows.begin(&flow_id).await;
        send_flow_result(id, result, &tx).await;
    });
    Ok(())
}

/// Handle config_entries/flow/progress - continue a flow
pub async fn handle_config_entries_flow_progress(
    conn: &Arc<ActiveConnection>,
    id: u64,
    flow_id: &str,
    user_input: Option<Value>,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    info!("Progressing config flow: {}", flow_id);

    let flows = Arc::clone(&conn.state.flows);
    let flow_id = flow_id.to_string();
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = flows.progress_flow(&flow_id, user_input).await;
        send_flow_result(id, result, &tx).await;
    });
    Ok(())
}

async fn send_flow_result(
    id: u64,
    result: Result<FlowResult, String>,
    tx: &mpsc::Sender<OutgoingMessage>,
) {
    let message = match result {
        Ok(flow_result) => OutgoingMessage::success(
            id,
            Some(serde_json::to_value(&flow_result).unwrap_or_default()),
        ),
        Err(e) => {
            warn!(id, "Config flow step failed: {}", e);
            OutgoingMessage::error(id, "flow_error", e)
        }
    };
    if tx.send(message).await.is_err() {
        debug!(id, "Connection closed before the flow step finished");
    }
}

/// Handle config_entries/flow/progress without a flow id - list flows
pub async fn handle_config_entries_flow_progress_list(
    conn: &Arc<ActiveConnection>,
    id: u64,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let flows = conn.state.flows.list_flows();
    tx.send(OutgoingMessage::success(id, Some(Value::Array(flows))))
        .await
        .map_err(|e| e.to_string())
}

/// Handle config_entries/flow/abort
pub async fn handle_config_entries_flow_abort(
    conn: &Arc<ActiveConnection>,
    id: u64,
    flow_id: &str,
    tx: &mpsc::Sender<OutgoingMessage>,
) -> Result<(), String> {
    let message = if conn.state.flows.abort_flow(flow_id) {
        OutgoingMessage::success(id, None)
    } else {
        OutgoingMessage::error(id, "not_found", format!("Flow not found: {flow_id}"))
    };
    tx.send(message).await.map_err(|e| e.to_string())
}

async fn send_empty(id: u64, tx: &mpsc::Sender<OutgoingMessage>) -> Result<(), String> {
    tx.send(OutgoingMessage::success(id, None))
        .await
        .map_err(|e| e.to_string())
}
