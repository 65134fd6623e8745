//! Bulk CSV transfer
//!
//! Sequential read-transform-write loops between the database and CSV files.
//! Both directions are blocking and report progress over a channel; callers on
//! the async runtime run them inside `spawn_blocking`.

use crate::arrow_values::batch_row;
use crate::cursor::RawValue;
use crate::executor::DuckDbExecutor;
use duckdb::{params, params_from_iter};
use std::fmt;
use std::path::Path;
use streamgate_common::{Result, StreamgateError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Export progress is reported every this many rows
const EXPORT_PROGRESS_INTERVAL: u64 = 100;

/// Rows appended per import transaction
const IMPORT_BATCH_SIZE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Export,
    Import,
}

/// Progress notification for a running transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub operation: TransferKind,
    pub rows: u64,
    pub finished: bool,
}

impl TransferProgress {
    fn running(operation: TransferKind, rows: u64) -> Self {
        Self {
            operation,
            rows,
            finished: false,
        }
    }

    fn done(operation: TransferKind, rows: u64) -> Self {
        Self {
            operation,
            rows,
            finished: true,
        }
    }
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.operation, self.finished) {
            (TransferKind::Export, false) => write!(f, "Exported {} rows", self.rows),
            (TransferKind::Export, true) => write!(f, "Export completed with {} rows", self.rows),
            (TransferKind::Import, false) => write!(f, "Imported {} rows", self.rows),
            (TransferKind::Import, true) => write!(f, "Import completed with {} rows", self.rows),
        }
    }
}

/// A listener that went away does not stop the transfer
fn notify(progress: &mpsc::Sender<TransferProgress>, update: TransferProgress) {
    debug!(progress = %update, "Transfer progress");
    let _ = progress.blocking_send(update);
}

/// Run `query` and write its result to `path` as CSV with a header row
///
/// Returns the number of data rows written.
pub fn export_csv(
    executor: &DuckDbExecutor,
    query: &str,
    path: impl AsRef<Path>,
    progress: &mpsc::Sender<TransferProgress>,
) -> Result<u64> {
    let path = path.as_ref();
    let conn = executor.connection()?;
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| StreamgateError::transfer(format!("failed to execute query: {}", e)))?;
    let arrow = stmt
        .query_arrow(params![])
        .map_err(|e| StreamgateError::transfer(format!("failed to execute query: {}", e)))?;
    let schema = arrow.get_schema();

    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| StreamgateError::transfer(format!("failed to create file: {}", e)))?;
    let headers: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    writer
        .write_record(&headers)
        .map_err(|e| StreamgateError::transfer(format!("failed to write headers: {}", e)))?;

    let mut rows: u64 = 0;
    for batch in arrow {
        for row_idx in 0..batch.num_rows() {
            let record: Vec<String> = batch_row(&batch, row_idx)
                .into_iter()
                .map(|value| match value {
                    RawValue::Null => String::new(),
                    other => other.to_string(),
                })
                .collect();
            writer
                .write_record(&record)
                .map_err(|e| StreamgateError::transfer(format!("failed to write record: {}", e)))?;

            rows += 1;
            if rows % EXPORT_PROGRESS_INTERVAL == 0 {
                notify(progress, TransferProgress::running(TransferKind::Export, rows));
            }
        }
    }
    writer
        .flush()
        .map_err(|e| StreamgateError::transfer(format!("failed to flush file: {}", e)))?;

    info!(path = %path.display(), rows, "CSV export finished");
    notify(progress, TransferProgress::done(TransferKind::Export, rows));
    Ok(rows)
}

/// Append every record of the CSV file at `path` to `table`
///
/// The header row names the target columns. Records are committed in
/// transactions of [`IMPORT_BATCH_SIZE`] rows; a failure rolls back the
/// batch in flight and aborts the import.
pub fn import_csv(
    executor: &DuckDbExecutor,
    path: impl AsRef<Path>,
    table: &str,
    progress: &mpsc::Sender<TransferProgress>,
) -> Result<u64> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| StreamgateError::transfer(format!("failed to open file: {}", e)))?;
    let headers = reader
        .headers()
        .map_err(|e| StreamgateError::transfer(format!("failed to read file headers: {}", e)))?
        .clone();
    if headers.is_empty() {
        return Err(StreamgateError::transfer("file has no header row"));
    }

    let sql = insert_statement(table, headers.iter());
    debug!(sql = %sql, "Prepared import statement");

    let conn = executor.connection()?;
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StreamgateError::transfer(format!("failed to prepare batch: {}", e)))?;

    let begin = |conn: &duckdb::Connection| {
        conn.execute_batch("BEGIN TRANSACTION")
            .map_err(|e| StreamgateError::transfer(format!("failed to begin batch: {}", e)))
    };
    let rollback = |conn: &duckdb::Connection| {
        let _ = conn.execute_batch("ROLLBACK");
    };

    begin(&conn)?;
    let mut rows: u64 = 0;
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                rollback(&conn);
                return Err(StreamgateError::transfer(format!("failed to read file: {}", e)));
            }
        };
        if let Err(e) = stmt.execute(params_from_iter(record.iter())) {
            rollback(&conn);
            return Err(StreamgateError::transfer(format!(
                "failed to append record to batch: {}",
                e
            )));
        }

        rows += 1;
        if rows % IMPORT_BATCH_SIZE == 0 {
            if let Err(e) = conn.execute_batch("COMMIT") {
                rollback(&conn);
                return Err(StreamgateError::transfer(format!("failed to send batch: {}", e)));
            }
            notify(progress, TransferProgress::running(TransferKind::Import, rows));
            begin(&conn)?;
        }
    }
    if let Err(e) = conn.execute_batch("COMMIT") {
        rollback(&conn);
        return Err(StreamgateError::transfer(format!(
            "failed to send final batch: {}",
            e
        )));
    }

    info!(path = %path.display(), table, rows, "CSV import finished");
    notify(progress, TransferProgress::done(TransferKind::Import, rows));
    Ok(rows)
}

/// `INSERT INTO "schema"."table" ("a", "b") VALUES (?, ?)`
fn insert_statement<'a>(table: &str, columns: impl Iterator<Item = &'a str>) -> String {
    let target = table
        .split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".");
    let columns: Vec<String> = columns.map(quote_identifier).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        target,
        columns.join(", "),
        placeholders
    )
}

fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn drain(rx: &mut mpsc::Receiver<TransferProgress>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(update) = rx.try_recv() {
            messages.push(update.to_string());
        }
        messages
    }

    #[test]
    fn test_insert_statement_quotes_identifiers() {
        let sql = insert_statement("main.people", ["id", "full \"name\""].into_iter());
        assert_eq!(
            sql,
            "INSERT INTO \"main\".\"people\" (\"id\", \"full \"\"name\"\"\") VALUES (?, ?)"
        );
    }

    #[test]
    fn test_export_writes_header_rows_and_progress() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let (tx, mut rx) = mpsc::channel(16);

        let rows = export_csv(
            &executor,
            "SELECT range AS n, 'row' || CAST(range AS VARCHAR) AS label, NULL AS missing FROM range(250) ORDER BY n",
            &path,
            &tx,
        )
        .unwrap();
        assert_eq!(rows, 250);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("n,label,missing"));
        assert_eq!(lines.next(), Some("0,row0,"));
        assert_eq!(content.lines().count(), 251);

        assert_eq!(
            drain(&mut rx),
            vec![
                "Exported 100 rows",
                "Exported 200 rows",
                "Export completed with 250 rows"
            ]
        );
    }

    #[test]
    fn test_export_bad_query_fails() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let err = export_csv(&executor, "SELECT * FROM missing_table", dir.path().join("x.csv"), &tx)
            .unwrap_err();
        assert_eq!(err.code(), "TRANSFER_FAILED");
    }

    #[test]
    fn test_import_commits_in_batches() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        executor
            .execute_batch("CREATE TABLE people (id VARCHAR, name VARCHAR)")
            .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,name").unwrap();
        for i in 0..2500 {
            writeln!(file, "{},person{}", i, i).unwrap();
        }
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let rows = import_csv(&executor, file.path(), "people", &tx).unwrap();
        assert_eq!(rows, 2500);
        assert_eq!(
            drain(&mut rx),
            vec![
                "Imported 1000 rows",
                "Imported 2000 rows",
                "Import completed with 2500 rows"
            ]
        );

        let conn = executor.connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM people", params![], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2500);
    }

    #[test]
    fn test_import_into_missing_table_fails() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id\n1").unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let err = import_csv(&executor, file.path(), "nowhere", &tx).unwrap_err();
        assert!(err.to_string().contains("failed to prepare batch"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_dropped_listener_does_not_fail_transfer() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let rows = export_csv(&executor, "SELECT 1 AS one", dir.path().join("one.csv"), &tx).unwrap();
        assert_eq!(rows, 1);
    }
}
