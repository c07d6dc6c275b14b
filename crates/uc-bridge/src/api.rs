//! HTTP surface: the control-channel websocket plus state endpoints that
//! let producers feed the state store

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uc_core::{Context, EntityId};

use crate::websocket;
use crate::BridgeState;

/// Body of `POST /api/states/{entity_id}`
#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: String) -> ApiError {
    (status, Json(ErrorResponse { message }))
}

/// Create the router
pub fn create_router(state: BridgeState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/websocket", get(websocket::ws_handler))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state).post(set_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the router on `addr` until the future is dropped
pub async fn start_server(state: BridgeState, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Bridge listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await
}

/// GET /api/states
async fn get_states(State(state): State<BridgeState>) -> Json<Vec<uc_core::State>> {
    Json(state.states().all())
}

/// GET /api/states/{entity_id}
async fn get_state(
    State(state): State<BridgeState>,
    Path(entity_id): Path<String>,
) -> Result<Json<uc_core::State>, ApiError> {
    state.states().get(&entity_id).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Entity not found: {}", entity_id),
        )
    })
}

/// POST /api/states/{entity_id}
///
/// Writing a state fires `state_changed`, which the registry forwards to
/// every remote subscribed to the entity.
async fn set_state(
    State(state): State<BridgeState>,
    Path(entity_id): Path<String>,
    Json(request): Json<SetStateRequest>,
) -> Result<(StatusCode, Json<uc_core::State>), ApiError> {
    let entity: EntityId = entity_id.parse().map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid entity_id: {}", entity_id),
        )
    })?;

    let existed = state.states().get(&entity_id).is_some();
    let new_state = state
        .states()
        .set(entity, request.state, request.attributes, Context::new());
    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(new_state)))
}
