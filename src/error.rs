//! Crate-wide error type.
//!
//! Every error kind in the design falls out to one of two wire shapes: an
//! HTTP status + JSON body (REST surface, via [`IntoResponse`]) or a
//! WebSocket close code (signaling admission, handled directly in
//! [`crate::ws`] since the connection is mid-handshake and never reaches an
//! `IntoResponse`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("too many rooms")]
    Capacity,

    #[error("not found")]
    NotFound,

    #[error("room is full")]
    Full,

    #[error("too many connections from this address")]
    ConnectionLimit,

    #[error("rate limited")]
    RateLimited,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Full => StatusCode::CONFLICT,
            AppError::ConnectionLimit => StatusCode::TOO_MANY_REQUESTS,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            AppError::Transport(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// WebSocket close codes used during admission (§6).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const ROOM_FULL: u16 = 4003;
    pub const ROOM_NOT_FOUND: u16 = 4004;
    pub const TOO_MANY_CONNECTIONS: u16 = 4029;
}
