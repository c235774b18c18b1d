//! Error types for pulsed.
//!
//! Delivery problems are never errors here; these cover decoding client
//! frames, rejecting bad HTTP input, and startup I/O.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for PulseError {
    fn into_response(self) -> Response {
        let status = match &self {
            PulseError::Protocol(_) => StatusCode::BAD_REQUEST,
            PulseError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PulseError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
