//! HTTP API.
//!
//! Exposes document status, unit results and the analyze trigger as JSON.
//! Analysis runs on the [`Dispatcher`] worker pool; `POST .../analyze`
//! returns as soon as the units exist and the document is queued.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/documents/{id}` | Document status and unit counts |
//! | `GET`  | `/documents/{id}/units` | Units with status, result and error |
//! | `POST` | `/documents/{id}/analyze` | Start analysis and enqueue the document |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 42 not found" } }
//! ```
//!
//! Error codes: `not_found` (404), `invalid_state` (409), `upload_failed`
//! (502), and the remaining pipeline codes as 500.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::driver::{Pipeline, StartOutcome};
use crate::error::PipelineError;
use crate::models::{AnalysisUnit, Document, UnitCounts, UnitStatus};
use crate::monitor::StuckMonitor;
use crate::runtime::Runtime;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Starts the HTTP server, the dispatcher workers and the stuck-unit monitor.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let runtime = Runtime::open(config).await?;
    let dispatcher = Arc::new(Dispatcher::start(
        runtime.pipeline.clone(),
        &config.dispatcher,
    ));

    let monitor = StuckMonitor::new(
        runtime.store.clone(),
        runtime.notifier.clone(),
        config.monitor.clone(),
    );
    tokio::spawn(async move { monitor.run().await });

    let state = AppState {
        pipeline: runtime.pipeline.clone(),
        dispatcher,
    };

    let bind_addr = config.server.bind.clone();
    println!("Dossier API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents/{id}", get(handle_get_document))
        .route("/documents/{id}/units", get(handle_list_units))
        .route("/documents/{id}/analyze", post(handle_analyze))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidState(_) => StatusCode::CONFLICT,
            PipelineError::Upload { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            PipelineError::NotFound(_) | PipelineError::InvalidState(_) => err.to_string(),
            _ => err.user_message(),
        };
        AppError {
            status,
            code: err.code().to_string(),
            message,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Store(err).into()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /documents/{id} ============

#[derive(Serialize)]
struct DocumentResponse {
    document: Document,
    units: UnitCounts,
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let store = state.pipeline.store();
    let document = store
        .get_document(&id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))?;
    let units = store.unit_counts(&id).await?;
    Ok(Json(DocumentResponse { document, units }))
}

// ============ GET /documents/{id}/units ============

/// Public view of a unit: parsed result, short error, no prompt text.
#[derive(Serialize)]
struct UnitView {
    id: String,
    stage_title: String,
    execution_order: i64,
    status: UnitStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    tokens_used: Option<i64>,
    model_used: Option<String>,
    execution_time_ms: Option<i64>,
}

impl From<AnalysisUnit> for UnitView {
    fn from(unit: AnalysisUnit) -> Self {
        let result = unit
            .result_json
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok());
        UnitView {
            id: unit.id,
            stage_title: unit.stage_title,
            execution_order: unit.execution_order,
            status: unit.status,
            result,
            error: unit.last_error,
            tokens_used: unit.tokens_used,
            model_used: unit.model_used,
            execution_time_ms: unit.execution_time_ms,
        }
    }
}

#[derive(Serialize)]
struct UnitListResponse {
    units: Vec<UnitView>,
}

async fn handle_list_units(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UnitListResponse>, AppError> {
    let store = state.pipeline.store();
    if store.get_document(&id).await?.is_none() {
        return Err(PipelineError::NotFound(format!("document {}", id)).into());
    }
    let units = store.list_units(&id).await?;
    Ok(Json(UnitListResponse {
        units: units.into_iter().map(UnitView::from).collect(),
    }))
}

// ============ POST /documents/{id}/analyze ============

async fn handle_analyze(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StartOutcome>), AppError> {
    let outcome = state.pipeline.start_analysis(&id).await?;
    state.dispatcher.enqueue(&id);
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}
