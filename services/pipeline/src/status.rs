//! Status feed for the dashboard collaborator.
//!
//! Read-mostly JSON over HTTP: per-camera writer state and aggregate
//! segment counters. The only commands the pipeline accepts over this
//! surface are enable/disable camera and force-retry of a failed segment;
//! everything else about the pipeline is configuration, not remote control.

use crate::config::ApiConfig;
use crate::segment::{Segment, SegmentState, SegmentStore, StoreStats};
use crate::supervisor::{SupervisorRegistry, WriterStatus};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared state for the status API.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SegmentStore>,
    pub registry: Arc<SupervisorRegistry>,
    pub upload_tx: mpsc::Sender<Uuid>,
}

/// Full status feed payload.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub cameras: Vec<WriterStatus>,
    pub pipeline: StoreStats,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the API router.
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/segments/failed", get(list_failed_segments))
        .route("/api/v1/segments/:segment_id/retry", post(retry_segment))
        .route("/api/v1/cameras/:camera_id/enable", post(enable_camera))
        .route("/api/v1/cameras/:camera_id/disable", post(disable_camera))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the status API until shutdown.
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind status API address")?;

    info!(addr = %addr, "Status API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Status API server error")?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "camvault-pipeline"
    }))
}

/// Per-camera and aggregate status.
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        cameras: state.registry.snapshot(),
        pipeline: state.store.stats(),
    })
}

/// Failed segments awaiting operator attention.
async fn list_failed_segments(State(state): State<AppState>) -> Json<Vec<Segment>> {
    Json(state.store.in_state(SegmentState::Failed))
}

/// Force-retry a failed segment: back to the upload queue with a fresh
/// attempt budget.
async fn retry_segment(
    State(state): State<AppState>,
    Path(segment_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state.store.requeue_failed(segment_id).map_err(|e| {
        (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    if state.upload_tx.send(segment_id).await.is_err() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "upload queue is closed".to_string(),
            }),
        ));
    }

    info!(segment_id = %segment_id, "Operator requeued failed segment");
    Ok(StatusCode::ACCEPTED)
}

/// Resume supervision of a camera.
async fn enable_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    set_camera_enabled(&state, &camera_id, true)
}

/// Stop a camera's writer and keep it stopped.
async fn disable_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    set_camera_enabled(&state, &camera_id, false)
}

fn set_camera_enabled(
    state: &AppState,
    camera_id: &str,
    enabled: bool,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if state.registry.set_enabled(camera_id, enabled) {
        info!(camera_id = %camera_id, enabled, "Operator changed camera state");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown camera {camera_id:?}"),
            }),
        ))
    }
}
