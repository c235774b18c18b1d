//! pulsed — live balance and notification relay.
//!
//! Clients connect over WebSocket, authenticate as a user, and receive
//! `balance_updated` / `system_notification` pushes, either on request or
//! from the periodic dispatch tick.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod sources;
pub mod state;
pub mod types;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket endpoint.
        .route("/ws", get(ws::ws_handler))
        // Registry snapshot for the rest of the application.
        .route("/health", get(http::health))
        // Liveness probe.
        .route("/healthz", get(http::healthz))
        .route("/api/notifications", post(http::notify))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
