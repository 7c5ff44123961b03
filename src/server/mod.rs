//! Operational HTTP surface.
//!
//! Debug-grade endpoints for triggering pulls, registering schedules,
//! submitting one-off URLs and reading a status snapshot.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::core::services::{ServiceError, Services, StatusSnapshot, SubmitOutcome};
use crate::domain::{QuotaStatus, SourceFamily};

/// Error body: `{"ok": false, "error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = match &e {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Store(_) | ServiceError::JobStore(_) | ServiceError::Orchestrator(_) => {
                warn!(error = %e, "Ops request failed");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// Malformed or incomplete bodies get the same error shape as everything else
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "ok": false, "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ops/status", get(status))
        .route("/ops/quota", get(quota))
        .route("/ops/pull", post(pull))
        .route("/ops/schedule", post(schedule))
        .route("/ops/submit", post(submit))
        .route("/ops/sources/{id}/pause", post(pause_source))
        .route("/ops/sources/{id}/resume", post(resume_source))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    services: Arc<Services>,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "Ops server listening");
    axum::serve(listener, router(services))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status(State(services): State<Arc<Services>>) -> ApiResult<StatusSnapshot> {
    Ok(Json(services.status()?))
}

async fn quota(State(services): State<Arc<Services>>) -> Json<QuotaStatus> {
    Json(services.quota_status())
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    source: String,
}

async fn pull(
    State(services): State<Arc<Services>>,
    body: Result<Json<PullRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(req) = body?;
    let family: SourceFamily = req
        .source
        .parse()
        .map_err(|e: anyhow::Error| ApiError::bad_request(e.to_string()))?;
    let job_id = services.trigger_pull(family)?;
    Ok(Json(json!({ "ok": true, "source": family, "jobId": job_id })))
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    queue: String,
    cron: String,
    tz: Option<String>,
    payload: Option<Value>,
}

async fn schedule(
    State(services): State<Arc<Services>>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(req) = body?;
    services.register_schedule(&req.queue, &req.cron, req.tz.as_deref(), req.payload)?;
    Ok(Json(json!({ "ok": true, "queue": req.queue, "cron": req.cron })))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    url: String,
    title: Option<String>,
}

async fn submit(
    State(services): State<Arc<Services>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<SubmitOutcome> {
    let Json(req) = body?;
    Ok(Json(services.submit_url(&req.url, req.title.as_deref())?))
}

async fn pause_source(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    services.set_source_active(&id, false)?;
    Ok(Json(json!({ "ok": true, "id": id, "active": false })))
}

async fn resume_source(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    services.set_source_active(&id, true)?;
    Ok(Json(json!({ "ok": true, "id": id, "active": true })))
}
