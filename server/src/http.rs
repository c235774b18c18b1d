//! REST surface: health snapshot and notification push.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PulseError;
use crate::state::AppState;
use crate::types::{NotificationEvent, Priority, UserId};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Live connections, authenticated or not.
    pub connected_users: usize,
    pub timestamp: DateTime<Utc>,
}

/// GET /health — read-only registry snapshot.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        connected_users: state.registry.len(),
        timestamp: Utc::now(),
    })
}

/// Liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub user_id: Option<UserId>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub broadcast: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub delivered: usize,
}

impl TryFrom<NotifyRequest> for NotificationEvent {
    type Error = PulseError;

    fn try_from(req: NotifyRequest) -> Result<Self, Self::Error> {
        if req.title.trim().is_empty() {
            return Err(PulseError::InvalidRequest("title must not be empty".into()));
        }
        if !req.broadcast && req.user_id.is_none() {
            return Err(PulseError::InvalidRequest(
                "userId is required unless broadcast is set".into(),
            ));
        }
        Ok(NotificationEvent {
            user_id: if req.broadcast { None } else { req.user_id },
            title: req.title,
            message: req.message,
            priority: req.priority,
            broadcast: req.broadcast,
        })
    }
}

/// POST /api/notifications — push a notification to a user or to everyone.
pub async fn notify(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NotifyRequest>,
) -> Result<impl IntoResponse, PulseError> {
    let event = NotificationEvent::try_from(req)?;
    info!(
        broadcast = event.broadcast,
        priority = event.priority.as_str(),
        title = %event.title,
        "notification pushed"
    );
    let delivered = state.dispatcher.notify(event);
    Ok((StatusCode::ACCEPTED, Json(NotifyResponse { delivered })))
}
