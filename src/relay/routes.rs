//! REST surface over the [`crate::relay::RelayStore`] (§4.H): upload,
//! info, download, delete. Upload and download both stream the body —
//! neither handler buffers a whole file in memory.

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::AppError;
use crate::AppState;

pub fn relay_router() -> Router<AppState> {
    Router::new()
        .route("/api/relay/upload", post(upload))
        .route("/api/relay/download/{id}", get(download))
        .route("/api/relay/info/{id}", get(info))
        .route("/api/relay/{id}", delete(delete_file))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    #[serde(default, rename = "roomCode")]
    room_code: Option<String>,
    #[serde(default)]
    compress: bool,
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_mime_type", rename = "mimeType")]
    mime_type: String,
}

fn default_name() -> String {
    "upload.bin".to_string()
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// `POST /api/relay/upload?roomCode&compress&name&mimeType`.
///
/// The declared size (§4.G step 1-2) comes from `Content-Length` — there is
/// no multipart parsing (§OPEN QUESTIONS #3): the request body is the file,
/// streamed straight into [`crate::relay::RelayStore::ingest`].
async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    request: Request,
) -> Result<Json<serde_json::Value>, AppError> {
    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let body = request.into_body().into_data_stream();

    let metadata = state
        .relay
        .ingest(
            body,
            declared_len,
            params.name,
            params.mime_type,
            params.room_code,
            params.compress,
        )
        .await?;

    let download_url = format!("/api/relay/download/{}", metadata.id);
    let mut value = serde_json::to_value(&metadata).expect("FileMetadata always serializes");
    value["downloadUrl"] = json!(download_url);
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    #[serde(default = "default_true")]
    decompress: bool,
}

fn default_true() -> bool {
    true
}

/// `GET /api/relay/download/{id}?decompress`.
async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, AppError> {
    let (metadata, stream) = state.relay.download(&id, params.decompress).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", metadata.name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&metadata.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        "X-Original-Size",
        HeaderValue::from_str(&metadata.original_size.to_string()).expect("digits are valid"),
    );
    headers.insert(
        "X-Checksum",
        HeaderValue::from_str(&metadata.checksum).expect("hex digest is valid"),
    );
    headers.insert(
        "X-Compressed",
        HeaderValue::from_static(if metadata.compressed && !params.decompress {
            "true"
        } else {
            "false"
        }),
    );

    let body = axum::body::Body::from_stream(stream);
    Ok((StatusCode::OK, headers, body).into_response())
}

/// `GET /api/relay/info/{id}`.
async fn info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::relay::FileMetadata>, AppError> {
    Ok(Json(state.relay.info(&id)?))
}

/// `DELETE /api/relay/{id}`. Idempotent: deleting a missing id still
/// reports success (§4.G).
async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.relay.delete(&id).await?;
    Ok(Json(json!({ "deleted": true })))
}
