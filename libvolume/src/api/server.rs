//! HTTP/JSON request surface of the control plane.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::error::{ApiError, ErrorCode};
use crate::lifecycle::VolumeLifecycle;
use crate::types::{
    BackendInfo, CreateVolumeRequest, PublishVolumeRequest, StageVolumeRequest,
    UnpublishVolumeRequest, UnstageVolumeRequest, Volume,
};

type ApiResult<T> = Result<T, ApiError>;
type JsonBody<T> = Result<Json<T>, JsonRejection>;

/// Response of `GET /api/v1/volumes`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeList {
    pub volumes: Vec<Volume>,
    pub count: usize,
}

/// Response of `GET /api/v1/backends`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackendList {
    pub backends: Vec<BackendInfo>,
    pub count: usize,
}

/// Acknowledgement for operations that return no record.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// Deadline for a whole request, store round trips included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the control-plane router.
pub fn router(lifecycle: Arc<VolumeLifecycle>) -> Router {
    router_with_timeout(lifecycle, REQUEST_TIMEOUT)
}

/// Build the router with a custom request deadline. Requests that exceed it
/// are answered with `408 Request Timeout`.
pub fn router_with_timeout(lifecycle: Arc<VolumeLifecycle>, timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/v1/volumes", get(list_volumes).post(create_volume))
        .route(
            "/api/v1/volumes/{id}",
            get(get_volume).delete(delete_volume),
        )
        .route(
            "/api/v1/volumes/{id}/stage",
            post(stage_volume).delete(unstage_volume),
        )
        .route(
            "/api/v1/volumes/{id}/publish",
            post(publish_volume).delete(unpublish_volume),
        )
        .route("/api/v1/backends", get(list_backends))
        .layer(TimeoutLayer::new(timeout))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(lifecycle)
}

/// Turn a handler panic into a JSON `500 internal_error`.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "request handler panicked");
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::InternalError,
        "internal server error",
    )
    .into_response()
}

/// Serve the API on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    lifecycle: Arc<VolumeLifecycle>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "control-plane API listening");
    }
    axum::serve(listener, router(lifecycle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

fn body<T>(payload: JsonBody<T>) -> ApiResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::invalid_request(format!("invalid request body: {}", e.body_text())))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "rkvol-manager" }))
}

async fn ready(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
) -> (StatusCode, Json<serde_json::Value>) {
    if lifecycle.store().is_ready().await {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "code": ErrorCode::NotReady })),
        )
    }
}

async fn create_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    payload: JsonBody<CreateVolumeRequest>,
) -> ApiResult<(StatusCode, Json<Volume>)> {
    let req = body(payload)?;
    let volume = lifecycle.create_volume(req).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn list_volumes(State(lifecycle): State<Arc<VolumeLifecycle>>) -> ApiResult<Json<VolumeList>> {
    let volumes = lifecycle.list_volumes().await?;
    Ok(Json(VolumeList {
        count: volumes.len(),
        volumes,
    }))
}

async fn get_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(lifecycle.get_volume(&id).await?))
}

async fn delete_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    lifecycle.delete_volume(&id).await?;
    Ok(MessageResponse::new("volume deleted"))
}

async fn stage_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    Path(id): Path<String>,
    payload: JsonBody<StageVolumeRequest>,
) -> ApiResult<Json<Volume>> {
    let req = body(payload)?;
    Ok(Json(lifecycle.stage_volume(&id, req).await?))
}

async fn unstage_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    Path(id): Path<String>,
    payload: JsonBody<UnstageVolumeRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let req = body(payload)?;
    lifecycle.unstage_volume(&id, req).await?;
    Ok(MessageResponse::new("volume unstaged"))
}

async fn publish_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    Path(id): Path<String>,
    payload: JsonBody<PublishVolumeRequest>,
) -> ApiResult<Json<Volume>> {
    let req = body(payload)?;
    Ok(Json(lifecycle.publish_volume(&id, req).await?))
}

async fn unpublish_volume(
    State(lifecycle): State<Arc<VolumeLifecycle>>,
    Path(id): Path<String>,
    payload: JsonBody<UnpublishVolumeRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let req = body(payload)?;
    lifecycle.unpublish_volume(&id, req).await?;
    Ok(MessageResponse::new("volume unpublished"))
}

async fn list_backends(State(lifecycle): State<Arc<VolumeLifecycle>>) -> Json<BackendList> {
    let backends = lifecycle.list_backends();
    Json(BackendList {
        count: backends.len(),
        backends,
    })
}
