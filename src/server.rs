//! HTTP server.
//!
//! Serves one shared [`ChainCoordinator`] to concurrent requests. Each
//! request obtains its handle through the coordinator and then queries it
//! outside the coordinator's lock, so slow model calls never hold up other
//! requests.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Current fingerprint, chunk and vector counts, rebuild count |
//! | `POST` | `/rebuild` | Rebuild the pipeline (forced unless `{"force": false}`) |
//! | `POST` | `/query` | Retrieval-augmented answer for `{"prompt": ...}` |
//! | `POST` | `/generate` | Unit tests for `{"payload": <AST JSON>}` |
//!
//! `/query` and `/generate` accept optional `k`, `mode` and `force_rebuild`
//! fields.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "prompt must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `model` (502), and the failing pipeline
//! stage (`corpus`, `embedding`, `index`, `retrieval`, `task`) with 500.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::coordinator::{ChainCoordinator, PipelineRequest, PipelineSnapshot, RetrieverConfig};
use crate::error::PipelineError;
use crate::prompt::test_generation_prompt;
use crate::query::{QueryExecutor, SourceRef};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    coordinator: Arc<ChainCoordinator>,
    executor: Arc<QueryExecutor>,
}

impl AppState {
    pub fn new(config: Config, coordinator: Arc<ChainCoordinator>) -> Self {
        Self {
            config: Arc::new(config),
            coordinator,
            executor: Arc::new(QueryExecutor::new()),
        }
    }
}

/// The route table, with CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/rebuild", post(handle_rebuild))
        .route("/query", post(handle_query))
        .route("/generate", post(handle_generate))
        .layer(cors)
        .with_state(state)
}

/// Build the coordinator from `config`, bind `[server].bind`, and serve
/// until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let coordinator = Arc::new(ChainCoordinator::from_config(config)?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    serve(listener, AppState::new(config.clone(), coordinator)).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
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

/// Internal error type that converts into an Axum HTTP response.
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::Model(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = match &err {
            PipelineError::InvalidRequest(_) => "bad_request",
            _ => err.stage(),
        };
        tracing::warn!(code, error = %err, "request failed");
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Request options ============

#[derive(Debug, Default, Deserialize)]
struct PipelineOptions {
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    force_rebuild: bool,
}

impl PipelineOptions {
    fn request(&self, config: &Config) -> Result<PipelineRequest, AppError> {
        let retriever =
            RetrieverConfig::from_settings(&config.retrieval, self.k, self.mode.as_deref())
                .map_err(|e| bad_request(e.to_string()))?;
        Ok(PipelineRequest {
            force_rebuild: self.force_rebuild,
            retriever,
        })
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

// ============ GET /status ============

async fn handle_status(State(state): State<AppState>) -> Json<PipelineSnapshot> {
    Json(state.coordinator.snapshot().await)
}

// ============ POST /rebuild ============

#[derive(Debug, Deserialize)]
struct RebuildRequest {
    #[serde(default = "default_true")]
    force: bool,
}

fn default_true() -> bool {
    true
}

async fn handle_rebuild(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<PipelineSnapshot>, AppError> {
    // An empty body means a forced rebuild.
    let force = if body.iter().all(|b| b.is_ascii_whitespace()) {
        true
    } else {
        serde_json::from_slice::<RebuildRequest>(&body)
            .map_err(|e| bad_request(format!("invalid rebuild request: {}", e)))?
            .force
    };
    let retriever = RetrieverConfig::from_settings(&state.config.retrieval, None, None)
        .map_err(|e| bad_request(e.to_string()))?;
    if force {
        state.coordinator.invalidate_and_rebuild(retriever).await?;
    } else {
        state
            .coordinator
            .get_or_build(PipelineRequest::new(retriever))
            .await?;
    }
    Ok(Json(state.coordinator.snapshot().await))
}

// ============ POST /query ============

#[derive(Debug, Deserialize)]
struct QueryRequest {
    prompt: String,
    #[serde(flatten)]
    options: PipelineOptions,
}

#[derive(Serialize)]
struct QueryResponse {
    answer: String,
    fingerprint: String,
    sources: Vec<SourceRef>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let request = req.options.request(&state.config)?;
    let handle = state.coordinator.get_or_build(request).await?;
    let answer = state.executor.answer(&handle, &req.prompt).await?;

    Ok(Json(QueryResponse {
        answer: answer.text,
        fingerprint: handle.fingerprint().to_string(),
        sources: answer.sources,
    }))
}

// ============ POST /generate ============

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    /// AST description of the class under test: a JSON string, or any JSON
    /// value which is serialized before embedding.
    payload: serde_json::Value,
    #[serde(flatten)]
    options: PipelineOptions,
}

#[derive(Serialize)]
struct GenerateResponse {
    text: String,
    fingerprint: String,
}

async fn handle_generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let payload = match &req.payload {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => return Err(bad_request("payload must not be null")),
        other => other.to_string(),
    };
    let request = req.options.request(&state.config)?;
    let handle = state.coordinator.get_or_build(request).await?;
    let text = state
        .executor
        .execute(&handle, &test_generation_prompt(&payload))
        .await?;

    Ok(Json(GenerateResponse {
        text,
        fingerprint: handle.fingerprint().to_string(),
    }))
}
