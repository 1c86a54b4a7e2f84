//! LockIn HTTP API
//!
//! Axum-based HTTP server the desktop client talks to.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a pure
//! inner function. The inner functions are directly testable without axum dispatch
//! machinery.
//!
//! Endpoints:
//! - GET  /health              — health check with store status
//! - GET  /version             — server version info
//! - POST /analyze-screenshot  — describe a screenshot and decide on a nudge
//! - POST /upload-screenshot   — store a raw screenshot
//! - GET  /screenshots         — list stored screenshots

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use lockin_core::models::ScreenshotUpload;
use lockin_core::{
    AnalysisPipeline, AnalysisRequest, LockinConfig, LockinError, OpenAiClient,
    OpenAiClientConfig, PipelineError, RetryPolicy,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::upload;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub pool: SqlitePool,
    pub pipeline: AnalysisPipeline,
    pub screenshot_dir: PathBuf,
    /// Overall deadline for one analysis request.
    pub request_timeout: Duration,
}

impl HttpState {
    pub fn new(pool: SqlitePool, pipeline: AnalysisPipeline, config: &LockinConfig) -> Self {
        Self {
            pool,
            pipeline,
            screenshot_dir: PathBuf::from(&config.storage.screenshot_dir),
            request_timeout: Duration::from_secs(config.analysis.request_timeout_seconds),
        }
    }

    /// Connect the store and build the OpenAI-backed pipeline from config.
    pub async fn from_config(config: &LockinConfig) -> Result<Self, LockinError> {
        let pool = lockin_core::db::create_pool(&config.storage).await?;
        lockin_core::db::migrate(&pool).await?;
        tokio::fs::create_dir_all(&config.storage.screenshot_dir).await?;

        let client = OpenAiClient::with_base_url(
            OpenAiClientConfig::new(None, &config.openai),
            config.openai.base_url.clone(),
        )?;
        let pipeline = AnalysisPipeline::new(
            Arc::new(client),
            RetryPolicy::from(&config.retry)
                .with_call_timeout(Duration::from_secs(config.openai.timeout_seconds)),
            config.analysis.ignored_window.clone(),
        );

        Ok(Self::new(pool, pipeline, config))
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/analyze-screenshot", post(analyze_handler))
        .route("/upload-screenshot", post(upload_handler))
        .route("/screenshots", get(screenshots_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: &LockinConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("LockIn HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn body(msg: impl Into<String>) -> serde_json::Value {
        serde_json::to_value(Self::new(msg)).unwrap_or_default()
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: queries the store and returns (status_code, json_body).
pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    match lockin_core::db::health_check(&state.pool).await {
        Ok(sqlite_ver) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "sqlite": sqlite_ver,
                "model": state.pipeline.model_name(),
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "lockin/1",
    })
}

/// Inner analyze: runs the pipeline under the request deadline.
///
/// Remote-call faults never reach this level; only structural faults (400),
/// a blown deadline (504) or a panic (500) produce an error body.
pub async fn analyze_inner(
    state: &HttpState,
    req: AnalysisRequest,
) -> (StatusCode, serde_json::Value) {
    let analysis = AssertUnwindSafe(state.pipeline.analyze(req)).catch_unwind();

    match tokio::time::timeout(state.request_timeout, analysis).await {
        Ok(Ok(Ok(response))) => match serde_json::to_value(&response) {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize analysis response");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::body("internal server error"),
                )
            }
        },
        Ok(Ok(Err(PipelineError::InvalidRequest(msg)))) => {
            (StatusCode::BAD_REQUEST, ErrorResponse::body(msg))
        }
        Ok(Err(panic)) => {
            let detail = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(detail = %detail, "Analysis pipeline panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::body("internal server error"),
            )
        }
        Err(_) => {
            tracing::error!(
                timeout_secs = state.request_timeout.as_secs(),
                "Analysis request exceeded its deadline"
            );
            (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::body("analysis timed out"),
            )
        }
    }
}

/// Inner upload: decodes, stores and records one screenshot.
pub async fn upload_inner(
    state: &HttpState,
    upload: ScreenshotUpload,
) -> (StatusCode, serde_json::Value) {
    match upload::store_upload(upload, &state.pool, &state.screenshot_dir).await {
        Ok(filename) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "success",
                "filename": filename,
            }),
        ),
        Err(e) if e.is_client_error() => (StatusCode::BAD_REQUEST, ErrorResponse::body(e.to_string())),
        Err(e) => {
            tracing::error!(error = %e, "Screenshot upload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::body("failed to store screenshot"),
            )
        }
    }
}

/// Inner list: every stored screenshot record.
pub async fn screenshots_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    let rows = match lockin_core::db::list_screenshots(&state.pool).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list screenshots");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::body("failed to list screenshots"),
            );
        }
    };

    match serde_json::to_value(&rows) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(e.to_string())),
    }
}

/// Map a JSON extraction failure to a 400 with our error body.
pub fn rejection_inner(rejection: JsonRejection) -> (StatusCode, serde_json::Value) {
    tracing::debug!(error = %rejection, "Rejected malformed request body");
    (
        StatusCode::BAD_REQUEST,
        ErrorResponse::body(rejection.body_text()),
    )
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn analyze_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match payload {
        Ok(Json(req)) => analyze_inner(&state, req).await,
        Err(rejection) => rejection_inner(rejection),
    };
    (status, Json(body))
}

pub async fn upload_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<ScreenshotUpload>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match payload {
        Ok(Json(upload)) => upload_inner(&state, upload).await,
        Err(rejection) => rejection_inner(rejection),
    };
    (status, Json(body))
}

pub async fn screenshots_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = screenshots_inner(&state).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
