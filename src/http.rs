//! Thin REST surface (component J, §2): health, aggregate stats, and room
//! lifecycle endpoints. Wiring over [`crate::registry::RoomRegistry`] — no
//! logic of its own beyond shaping requests/responses (§6).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::AppError;
use crate::protocol::RoomCode;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health))
        .route("/api/stats", get(stats))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/{code}", get(room_info))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    active_rooms: usize,
    total_connections: u64,
    total_messages: u64,
    total_bytes_relayed: u64,
    uptime_seconds: u64,
    avg_latency_ms: f64,
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let s = state.registry.stats();
    Json(StatsResponse {
        active_rooms: s.active_rooms,
        total_connections: s.total_connections,
        total_messages: s.total_messages,
        total_bytes_relayed: state.relay.total_bytes_relayed(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        avg_latency_ms: s.avg_latency_ms,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomResponse {
    room_code: RoomCode,
    created: bool,
}

/// `POST /api/rooms`.
async fn create_room(State(state): State<AppState>) -> Result<Json<CreateRoomResponse>, AppError> {
    let code = state.registry.create()?;
    Ok(Json(CreateRoomResponse {
        room_code: code,
        created: true,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfoResponse {
    code: RoomCode,
    created_at: DateTime<Utc>,
    peer_count: usize,
    has_host: bool,
}

/// `GET /api/rooms/{code}`.
async fn room_info(
    State(state): State<AppState>,
    Path(code_raw): Path<String>,
) -> Result<Json<RoomInfoResponse>, AppError> {
    let code = RoomCode::parse(&code_raw).ok_or(AppError::NotFound)?;
    let summary = state.registry.lookup_summary(&code).ok_or(AppError::NotFound)?;
    Ok(Json(RoomInfoResponse {
        code: summary.code,
        created_at: summary.created_at,
        peer_count: summary.peer_count,
        has_host: summary.has_host,
    }))
}
