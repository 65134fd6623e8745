//! HTTP REST API for synchronous queries, bulk transfers and management

use crate::metrics;
use crate::stream::coercion::{CoercionPlan, TransportValue};
use crate::stream::{ws_handler, SessionConfig};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use streamgate_common::StreamgateError;
use streamgate_engine::{export_csv, import_csv, DuckDbExecutor, QueryBackend, TransferProgress};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<DuckDbExecutor>,
    pub session_config: SessionConfig,
    /// Server-wide shutdown; parent of every session's token
    pub shutdown: CancellationToken,
    /// CSV export and import paths are resolved inside this directory
    pub transfer_dir: PathBuf,
}

/// All routes, with permissive CORS
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .route("/ws", get(ws_handler))
        .route("/api/query", post(execute_query))
        .route("/api/export", post(export_query))
        .route("/api/import", post(import_file))
        .layer(cors)
        .with_state(state)
}

/// Query execution request
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

/// Query execution response
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<TransportValue>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: &StreamgateError) -> Response {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = ErrorResponse {
        error: e.to_string(),
        code: e.code().to_string(),
    };
    (status, Json(body)).into_response()
}

/// Execute a SQL query and return the whole result at once
pub async fn execute_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Response {
    info!("HTTP query request: {}", request.sql);
    let start_time = Instant::now();

    match run_to_completion(&state, &request.sql).await {
        Ok(mut response) => {
            let elapsed = start_time.elapsed();
            metrics::record_http_query("success", elapsed.as_secs_f64());
            response.execution_time_ms = elapsed.as_millis() as u64;
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            metrics::record_http_query("error", start_time.elapsed().as_secs_f64());
            error!("Query failed: {}", e);
            error_response(&e)
        }
    }
}

async fn run_to_completion(state: &AppState, sql: &str) -> Result<QueryResponse, StreamgateError> {
    if sql.trim().is_empty() {
        return Err(StreamgateError::InvalidArgument("sql must not be empty".to_string()));
    }

    let mut cursor = state
        .executor
        .query(state.shutdown.child_token(), sql)
        .await?;
    let plan = CoercionPlan::new(cursor.columns());
    let column_types = cursor
        .columns()
        .iter()
        .map(|c| c.type_name.clone())
        .collect();

    let mut rows = Vec::new();
    while let Some(row) = cursor.next_row().await? {
        let values = plan
            .coerce_row(row)
            .map_err(|e| StreamgateError::SerializationError(format!("Row scan error: {}", e)))?;
        rows.push(values);
    }

    Ok(QueryResponse {
        columns: plan.column_names(),
        column_types,
        row_count: rows.len(),
        rows,
        execution_time_ms: 0,
    })
}

/// Resolve a client-supplied transfer path inside `root`
///
/// The path must be relative and free of `..`; after symlinks are resolved it
/// must still lie under `root`.
fn resolve_transfer_path(root: &Path, requested: &str) -> Result<PathBuf, StreamgateError> {
    let relative = Path::new(requested);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if requested.is_empty() || !plain {
        return Err(StreamgateError::InvalidArgument(format!(
            "path '{}' must be relative to the transfer directory",
            requested
        )));
    }

    let root = root.canonicalize().map_err(|e| {
        StreamgateError::ConfigError(format!(
            "transfer directory {} unavailable: {}",
            root.display(),
            e
        ))
    })?;
    let candidate = root.join(relative);
    let resolved = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) => match (candidate.parent().map(Path::canonicalize), candidate.file_name()) {
            (Some(Ok(parent)), Some(name)) => parent.join(name),
            _ => candidate,
        },
    };
    if !resolved.starts_with(&root) {
        return Err(StreamgateError::InvalidArgument(format!(
            "path '{}' leaves the transfer directory",
            requested
        )));
    }
    Ok(resolved)
}

/// Export request: query results to a CSV file in the transfer directory
#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub sql: String,
    /// Relative to the transfer directory
    pub output_path: String,
}

/// Import request: CSV file in the transfer directory into an existing table
#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    /// Relative to the transfer directory
    pub input_path: String,
    pub table: String,
}

/// Transfer response
#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub rows: u64,
    pub message: String,
    pub execution_time_ms: u64,
}

/// Export query results to a CSV file
pub async fn export_query(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Response {
    info!("Export request to {}: {}", request.output_path, request.sql);
    if request.sql.trim().is_empty() || request.output_path.is_empty() {
        let e = StreamgateError::InvalidArgument("sql and output_path are required".to_string());
        return error_response(&e);
    }

    let output_path = match resolve_transfer_path(&state.transfer_dir, &request.output_path) {
        Ok(path) => path,
        Err(e) => {
            error!("Export rejected: {}", e);
            return error_response(&e);
        }
    };

    let executor = state.executor.clone();
    run_transfer("export", move |progress| {
        export_csv(&executor, &request.sql, &output_path, &progress)
    })
    .await
}

/// Import a CSV file into a table
pub async fn import_file(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Response {
    info!("Import request from {} into {}", request.input_path, request.table);
    if request.input_path.is_empty() || request.table.trim().is_empty() {
        let e = StreamgateError::InvalidArgument("input_path and table are required".to_string());
        return error_response(&e);
    }

    let input_path = match resolve_transfer_path(&state.transfer_dir, &request.input_path) {
        Ok(path) => path,
        Err(e) => {
            error!("Import rejected: {}", e);
            return error_response(&e);
        }
    };

    let executor = state.executor.clone();
    run_transfer("import", move |progress| {
        import_csv(&executor, &input_path, &request.table, &progress)
    })
    .await
}

/// Run a blocking transfer, logging its progress notifications
async fn run_transfer<F>(direction: &'static str, transfer: F) -> Response
where
    F: FnOnce(mpsc::Sender<TransferProgress>) -> streamgate_common::Result<u64> + Send + 'static,
{
    let start = Instant::now();
    let (progress_tx, mut progress_rx) = mpsc::channel::<TransferProgress>(64);

    let logger = tokio::spawn(async move {
        let mut last = None;
        while let Some(update) = progress_rx.recv().await {
            info!(direction, rows = update.rows, "{}", update);
            last = Some(update);
        }
        last
    });

    let result = tokio::task::spawn_blocking(move || transfer(progress_tx))
        .await
        .map_err(|e| StreamgateError::internal(format!("transfer task failed: {}", e)))
        .and_then(|r| r);
    let last = logger.await.ok().flatten();
    let execution_time_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(rows) => {
            metrics::record_transfer(direction, "success");
            let message = match last {
                Some(update) if update.finished => update.to_string(),
                _ => format!("{} completed with {} rows", direction, rows),
            };
            info!(direction, rows, execution_time_ms, "Transfer finished");
            (
                StatusCode::OK,
                Json(TransferResponse {
                    rows,
                    message,
                    execution_time_ms,
                }),
            )
                .into_response()
        }
        Err(e) => {
            metrics::record_transfer(direction, "error");
            error!(direction, "Transfer failed: {}", e);
            error_response(&e)
        }
    }
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Ready once the database answers
pub async fn ready(State(state): State<AppState>) -> Response {
    let executor = state.executor.clone();
    match tokio::task::spawn_blocking(move || executor.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, "OK").into_response(),
        Ok(Err(e)) => {
            error!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        }
        Err(e) => {
            error!("Readiness check panicked: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        }
    }
}

/// Root endpoint
pub async fn root() -> &'static str {
    "Streamgate Gateway - streaming SQL over WebSocket at /ws"
}
