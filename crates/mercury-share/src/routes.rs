//! HTTP and WebSocket routes for a sharing host.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use mercury_core::Server;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::host::HostServer;
use crate::transport;

/// Application state shared across handlers.
pub struct AppState {
    pub host: HostServer,
}

/// Create the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/share", get(share_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "guests": state.host.guest_count(),
        "connectionInfo": state.host.connection_info(),
    }))
}

/// Guest WebSocket upgrade handler.
async fn share_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_share_socket(socket, state))
}

async fn handle_share_socket(socket: WebSocket, state: Arc<AppState>) {
    let (link, bridge) = transport::accept(socket);
    let peer = state.host.attach_guest(link);
    if let Err(e) = bridge.await {
        tracing::warn!("Share connection task failed: {}", e);
    }
    peer.close();
}
