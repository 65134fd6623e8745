//! Streamgate Gateway Service
//!
//! Serves analytical queries against an embedded DuckDB database:
//! - WebSocket streaming sessions (/ws)
//! - Synchronous query API (/api/query)
//! - CSV export and import (/api/export, /api/import)
//! - Prometheus metrics (/metrics)

mod http_api;
mod metrics;
mod stream;
mod telemetry;

use crate::http_api::{router, AppState};
use crate::stream::SessionConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use streamgate_engine::{DuckDbExecutor, ExecutorConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "streamgate-gateway")]
#[command(about = "Streamgate Gateway - streaming SQL over WebSocket")]
struct Args {
    /// HTTP and WebSocket port
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind_addr: String,

    /// Database file; `:memory:` for an in-memory database
    #[arg(long, env = "STREAMGATE_DB_PATH")]
    db_path: Option<String>,

    /// DuckDB memory limit in megabytes
    #[arg(long, env = "STREAMGATE_DB_MAX_MEMORY_MB")]
    db_max_memory_mb: Option<u64>,

    /// DuckDB worker threads
    #[arg(long, env = "STREAMGATE_DB_THREADS")]
    db_threads: Option<u32>,

    /// Directory that CSV export and import paths are resolved in
    #[arg(long, env = "STREAMGATE_TRANSFER_DIR", default_value = "transfers")]
    transfer_dir: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    telemetry::init(&args.log_level)?;

    info!("Starting Streamgate Gateway");
    info!("  HTTP port: {}", args.http_port);

    metrics::init_metrics();

    let mut executor_config = ExecutorConfig::from_env();
    if let Some(path) = args.db_path {
        executor_config.database_path = path;
    }
    if let Some(mb) = args.db_max_memory_mb {
        executor_config.max_memory_bytes = Some(mb * 1024 * 1024);
    }
    if let Some(threads) = args.db_threads {
        executor_config.threads = Some(threads);
    }
    let executor = Arc::new(DuckDbExecutor::new(executor_config)?);

    let session_config = SessionConfig::from_env();
    session_config.validate()?;
    session_config.log_config();

    std::fs::create_dir_all(&args.transfer_dir)?;
    info!("  Transfer directory: {}", args.transfer_dir.display());

    let shutdown = CancellationToken::new();
    let app = router(AppState {
        executor,
        session_config,
        shutdown: shutdown.clone(),
        transfer_dir: args.transfer_dir,
    });

    let http_addr: SocketAddr = format!("{}:{}", args.bind_addr, args.http_port).parse()?;
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;

    info!("HTTP server listening on {}", http_addr);
    info!("  /ws - Streaming query sessions");
    info!("  /api/query - Synchronous queries");
    info!("  /metrics - Prometheus metrics");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down Streamgate Gateway");
            signal_token.cancel();
        })
        .await?;

    info!("Streamgate Gateway stopped");
    Ok(())
}
