//! HTTP surface: upload, result lookup, health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::channels::ChannelKind;
use crate::engine::{JobView, ReconciliationEngine};
use crate::error::{Error, JobError};
use crate::store::JobId;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    /// Channel used when an upload does not name one.
    pub default_channel: ChannelKind,
}

/// Build the Axum router with the upload and result routes.
pub fn api_routes(
    engine: Arc<ReconciliationEngine>,
    default_channel: ChannelKind,
    upload_max_bytes: usize,
) -> Router {
    let state = AppState {
        engine,
        default_channel,
    };

    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/result/{id}", get(result))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(upload_max_bytes)),
        )
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({"error": message.into()})))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.engine.store().counts().await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "vcf-relay",
        "channels": state.engine.channel_kinds(),
        "default_channel": state.default_channel,
        "jobs": counts,
    }))
}

// ── Upload ──────────────────────────────────────────────────────────────

/// Raw so a bad channel name gets the same JSON error shape as everything else.
#[derive(Debug, Deserialize)]
struct UploadParams {
    channel: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let kind = match params.channel.as_deref() {
        None => state.default_channel,
        Some(name) => match name.parse::<ChannelKind>() {
            Ok(kind) => kind,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
        },
    };

    let payload = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return error_body(StatusCode::BAD_REQUEST, "No file uploaded");
            }
            Err(e) => return error_body(e.status(), e.body_text()),
        };

        // Plain form fields are skipped; the first file part is the payload.
        if field.file_name().is_none() {
            debug!(field = field.name().unwrap_or_default(), "Skipping non-file form field");
            continue;
        }

        match field.bytes().await {
            Ok(bytes) => break bytes,
            Err(e) => return error_body(e.status(), e.body_text()),
        }
    };

    match state.engine.submit(&payload, kind).await {
        // Browser clients read `userId`; both keys carry the same id.
        Ok(job_id) => (
            StatusCode::OK,
            Json(serde_json::json!({"job_id": job_id, "userId": job_id})),
        ),
        Err(Error::Job(JobError::ChannelNotConfigured { channel })) => error_body(
            StatusCode::BAD_REQUEST,
            format!("Channel '{channel}' is not configured"),
        ),
        Err(Error::Channel(e)) => {
            warn!(channel = %kind, error = %e, "Upload dispatch failed");
            error_body(StatusCode::BAD_GATEWAY, "Failed to dispatch upload")
        }
        Err(e) => {
            warn!(channel = %kind, error = %e, "Upload failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

// ── Result ──────────────────────────────────────────────────────────────

async fn result(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.engine.query(&JobId::from(id)).await {
        JobView::NotFound => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"status": "not_found"})),
        ),
        JobView::Waiting => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "waiting"})),
        ),
        JobView::Done(data) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "done",
                "data": String::from_utf8_lossy(&data),
            })),
        ),
        JobView::Failed(reason) => (
            StatusCode::GONE,
            Json(serde_json::json!({"status": "failed", "reason": reason})),
        ),
    }
}
