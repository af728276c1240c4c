use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use docq_core::{AnalysisRequest, Orchestrator};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures that happen before a request reaches the orchestrator.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        // Over-limit bodies surface here as 413.
        Self {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(orchestrator: Arc<Orchestrator>, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/process", post(process_document))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    orchestrator: Arc<Orchestrator>,
    bind: &str,
    port: u16,
    body_limit: usize,
) -> Result<()> {
    orchestrator
        .artifact_store()
        .prepare()
        .await
        .context("failed to prepare artifact directory")?;

    let app = build_router(orchestrator, body_limit);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {bind}:{port}"))?;
    tracing::info!("docq serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("docq serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "workers_available": orchestrator.available_workers(),
    }))
}

/// `POST /api/process`: multipart `file` + `query`.
///
/// Missing parts are not rejected here; the orchestrator's validation
/// produces the error body so HTTP and CLI callers see the same messages.
async fn process_document(
    State(orchestrator): State<Arc<Orchestrator>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<axum::response::Response, AppError> {
    let mut multipart = multipart?;
    let mut request = AnalysisRequest::default();

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => {
                // A part without a filename is a form value, not an upload.
                let Some(name) = field.file_name().map(str::to_owned) else {
                    continue;
                };
                request.original_name = Some(name);
                request.content_type = field.content_type().map(str::to_owned);
                request.document = Some(field.bytes().await?.to_vec());
            }
            Some("query") => {
                request.query = Some(field.text().await?);
            }
            _ => {}
        }
    }

    let handled = orchestrator.handle(request).await;
    let status = StatusCode::from_u16(handled.response.status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(handled.response.body)).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
