//! DuckDB Query Executor
//!
//! Owns the embedded database handle. Every query runs on its own connection
//! cloned from that handle, inside a blocking task that feeds a [`RowCursor`].
//! Results are fetched lazily, one chunk at a time, so a slow consumer slows
//! the database down. Cancelling the query or releasing its cursor interrupts
//! the connection, which aborts execution even mid-operator.

use crate::arrow_values::{batch_row, describe_schema};
use crate::cursor::{ColumnDescriptor, QueryBackend, RawRow, RowCursor};
use async_trait::async_trait;
use duckdb::arrow::datatypes::SchemaRef;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::{params, Connection};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use streamgate_common::{env_or_default, env_parse_or_default, Result, StreamgateError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

/// DuckDB executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Database file, or `:memory:` for a private in-memory database
    pub database_path: String,
    /// Memory limit handed to DuckDB (in bytes)
    pub max_memory_bytes: Option<u64>,
    /// Number of DuckDB worker threads
    pub threads: Option<u32>,
    /// Rows a query producer may buffer ahead of its consumer
    pub channel_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            max_memory_bytes: None,
            threads: None,
            channel_capacity: 256,
        }
    }
}

impl ExecutorConfig {
    /// Load from `STREAMGATE_DB_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: env_or_default("STREAMGATE_DB_PATH", &defaults.database_path),
            max_memory_bytes: std::env::var("STREAMGATE_DB_MAX_MEMORY_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024),
            threads: std::env::var("STREAMGATE_DB_THREADS")
                .ok()
                .and_then(|v| v.parse().ok()),
            channel_capacity: env_parse_or_default(
                "STREAMGATE_CURSOR_BUFFER_ROWS",
                defaults.channel_capacity,
            ),
        }
    }

    /// Private in-memory database with default settings
    pub fn in_memory() -> Self {
        Self::default()
    }
}

/// DuckDB query executor
///
/// The server owns one executor; sessions and HTTP handlers only borrow it.
pub struct DuckDbExecutor {
    database: Mutex<Connection>,
    config: ExecutorConfig,
}

impl DuckDbExecutor {
    /// Open the database, apply settings and verify it answers
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        info!(
            path = %config.database_path,
            max_memory_mb = ?config.max_memory_bytes.map(|b| b / 1024 / 1024),
            threads = ?config.threads,
            "Opening DuckDB database"
        );

        let connection = if config.database_path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.database_path)
        }
        .map_err(StreamgateError::database)?;

        if let Some(max_memory) = config.max_memory_bytes {
            connection
                .execute(&format!("SET memory_limit = '{}B'", max_memory), params![])
                .map_err(StreamgateError::database)?;
        }
        if let Some(threads) = config.threads {
            connection
                .execute(&format!("SET threads = {}", threads), params![])
                .map_err(StreamgateError::database)?;
        }

        let executor = Self {
            database: Mutex::new(connection),
            config,
        };
        executor.ping()?;

        info!("DuckDB executor initialized");
        Ok(executor)
    }

    /// Shortcut for tests and tooling
    pub fn in_memory() -> Result<Self> {
        Self::new(ExecutorConfig::in_memory())
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// A fresh connection to the shared database
    pub fn connection(&self) -> Result<Connection> {
        let database = self
            .database
            .lock()
            .map_err(|e| StreamgateError::internal(format!("Lock poisoned: {}", e)))?;
        database.try_clone().map_err(StreamgateError::database)
    }

    /// Round-trip `SELECT 1`
    pub fn ping(&self) -> Result<()> {
        let conn = self.connection()?;
        let one: i32 = conn
            .query_row("SELECT 1", params![], |row| row.get(0))
            .map_err(StreamgateError::database)?;
        if one != 1 {
            return Err(StreamgateError::database(format!(
                "unexpected ping result {}",
                one
            )));
        }
        Ok(())
    }

    /// Run statements that return no rows (DDL, DML)
    #[instrument(skip(self))]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(sql).map_err(StreamgateError::query)
    }
}

#[async_trait]
impl QueryBackend for DuckDbExecutor {
    async fn query(&self, cancel: CancellationToken, sql: &str) -> Result<RowCursor> {
        if cancel.is_cancelled() {
            return Err(StreamgateError::QueryCancelled);
        }

        let conn = self.connection()?;
        let (header_tx, header_rx) = oneshot::channel();
        let (row_tx, row_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let sql = sql.to_string();

        // Fires on cancellation and on cursor release; stands down once the
        // producer has finished
        let stop = cancel.child_token();
        let finished = CancellationToken::new();
        let interrupt = conn.interrupt_handle();
        tokio::spawn({
            let stop = stop.clone();
            let finished = finished.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = finished.cancelled() => {}
                    _ = stop.cancelled() => {
                        debug!("Interrupting query");
                        interrupt.interrupt();
                    }
                }
            }
        });

        let producer_cancel = stop.clone();
        tokio::task::spawn_blocking(move || {
            let _finished = finished.drop_guard();
            produce_rows(conn, &sql, &producer_cancel, header_tx, row_tx)
        });

        let columns = match header_rx.await {
            Ok(Ok(columns)) => columns,
            Ok(Err(_)) | Err(_) if cancel.is_cancelled() => {
                return Err(StreamgateError::QueryCancelled)
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(StreamgateError::internal(
                    "query producer exited before reporting columns",
                ))
            }
        };
        let release: DropGuard = stop.drop_guard();
        Ok(RowCursor::new(columns, row_rx).on_release(move |rows| {
            debug!(rows, "Cursor released");
            drop(release);
        }))
    }
}

/// Result schema without running the query, when the statement can be
/// wrapped as a subquery
fn result_schema(conn: &Connection, sql: &str) -> Option<SchemaRef> {
    let wrapped = format!(
        "SELECT * FROM (\n{}\n) AS streamed LIMIT 0",
        sql.trim().trim_end_matches(';')
    );
    let mut stmt = conn.prepare(&wrapped).ok()?;
    let arrow = stmt.query_arrow(params![]).ok()?;
    Some(arrow.get_schema())
}

/// Blocking producer: execute, report columns, then push rows until the
/// result is drained, the query is cancelled, or the cursor is dropped.
///
/// Statements that cannot be described up front (`PRAGMA`, `SHOW`, ...) are
/// materialized before their first row.
fn produce_rows(
    conn: Connection,
    sql: &str,
    cancel: &CancellationToken,
    header: oneshot::Sender<Result<Vec<ColumnDescriptor>>>,
    rows: mpsc::Sender<Result<RawRow>>,
) {
    let schema = result_schema(&conn, sql);
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = header.send(Err(StreamgateError::query(e)));
            return;
        }
    };

    match schema {
        Some(schema) => {
            let mut stream = match stmt.stream_arrow(params![], schema.clone()) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = header.send(Err(StreamgateError::query(e)));
                    return;
                }
            };
            if !report_columns(header, describe_schema(&schema)) {
                return;
            }
            // A failed chunk fetch panics inside the driver
            pump_batches(cancel, &rows, || {
                catch_unwind(AssertUnwindSafe(|| stream.next()))
                    .map_err(|_| StreamgateError::query("failed to fetch result chunk"))
            });
        }
        None => {
            let mut arrow = match stmt.query_arrow(params![]) {
                Ok(arrow) => arrow,
                Err(e) => {
                    let _ = header.send(Err(StreamgateError::query(e)));
                    return;
                }
            };
            if !report_columns(header, describe_schema(&arrow.get_schema())) {
                return;
            }
            pump_batches(cancel, &rows, || Ok(arrow.next()));
        }
    }
}

fn report_columns(
    header: oneshot::Sender<Result<Vec<ColumnDescriptor>>>,
    columns: Vec<ColumnDescriptor>,
) -> bool {
    debug!(columns = columns.len(), "Query accepted");
    header.send(Ok(columns)).is_ok()
}

fn pump_batches<F>(cancel: &CancellationToken, rows: &mpsc::Sender<Result<RawRow>>, mut next_batch: F)
where
    F: FnMut() -> Result<Option<RecordBatch>>,
{
    let mut produced: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            debug!(rows = produced, "Producer observed cancellation");
            return;
        }
        let batch = match next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(_) if cancel.is_cancelled() => {
                debug!(rows = produced, "Query interrupted");
                return;
            }
            Err(e) => {
                warn!(rows = produced, error = %e, "Result fetch failed");
                let _ = rows.blocking_send(Err(e));
                return;
            }
        };

        for row_idx in 0..batch.num_rows() {
            if cancel.is_cancelled() {
                debug!(rows = produced, "Producer observed cancellation");
                return;
            }
            if rows.blocking_send(Ok(batch_row(&batch, row_idx))).is_err() {
                debug!(rows = produced, "Cursor released, stopping producer");
                return;
            }
            produced += 1;
            if produced % 100_000 == 0 {
                debug!("Streaming: {} rows produced", produced);
            }
        }
    }

    debug!(rows = produced, "Producer finished");
}
