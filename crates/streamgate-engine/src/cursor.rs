//! Row cursors over running queries
//!
//! A [`RowCursor`] is the consumer end of a bounded channel fed by whoever
//! executes the query (the DuckDB producer thread, or a scripted backend in
//! tests). The channel bound is what carries backpressure from a slow session
//! writer all the way back to row production.
//!
//! Dropping the cursor closes the channel; producers stop at their next push,
//! which releases the underlying statement on every exit path.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use streamgate_common::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Column name plus the type name declared by the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_name: String,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// A value as scanned by the database driver, before transport coercion
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Boolean(bool),
    Signed(i64),
    Unsigned(u64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    /// Driver-rendered text for types without a native mapping
    Other(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => write!(f, "NULL"),
            RawValue::Boolean(v) => write!(f, "{}", v),
            RawValue::Signed(v) => write!(f, "{}", v),
            RawValue::Unsigned(v) => write!(f, "{}", v),
            RawValue::Float32(v) => write!(f, "{}", v),
            RawValue::Float64(v) => write!(f, "{}", v),
            RawValue::Text(v) => f.write_str(v),
            RawValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            RawValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            RawValue::Other(v) => f.write_str(v),
        }
    }
}

/// One result row in column order
pub type RawRow = Vec<RawValue>;

/// Producer end of a cursor channel
pub type RowSender = mpsc::Sender<Result<RawRow>>;

/// Streaming cursor over one query's result rows
pub struct RowCursor {
    columns: Vec<ColumnDescriptor>,
    rows: mpsc::Receiver<Result<RawRow>>,
    rows_read: u64,
    exhausted: bool,
    on_release: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl RowCursor {
    /// Create a cursor and the sender a producer pushes rows into
    ///
    /// `capacity` bounds how far the producer may run ahead of the consumer.
    pub fn channel(columns: Vec<ColumnDescriptor>, capacity: usize) -> (RowSender, RowCursor) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, RowCursor::new(columns, rx))
    }

    pub fn new(columns: Vec<ColumnDescriptor>, rows: mpsc::Receiver<Result<RawRow>>) -> Self {
        Self {
            columns,
            rows,
            rows_read: 0,
            exhausted: false,
            on_release: None,
        }
    }

    /// Run `hook` with the number of rows read when the cursor is released
    pub fn on_release(mut self, hook: impl FnOnce(u64) + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Column descriptors, fixed for the lifetime of the cursor
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Fetch the next row
    ///
    /// `Ok(None)` marks the natural end of the result set. An `Err` is a
    /// mid-stream fetch failure reported by the producer; the cursor is
    /// exhausted afterwards.
    pub async fn next_row(&mut self) -> Result<Option<RawRow>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.rows.recv().await {
            Some(Ok(row)) => {
                self.rows_read += 1;
                Ok(Some(row))
            }
            Some(Err(e)) => {
                self.close_channel();
                Err(e)
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Rows handed out so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Release the cursor explicitly; dropping it has the same effect
    pub fn close(mut self) {
        self.close_channel();
    }

    fn close_channel(&mut self) {
        self.exhausted = true;
        self.rows.close();
    }
}

impl Drop for RowCursor {
    fn drop(&mut self) {
        self.close_channel();
        if let Some(hook) = self.on_release.take() {
            hook(self.rows_read);
        }
    }
}

impl fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCursor")
            .field("columns", &self.columns)
            .field("rows_read", &self.rows_read)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// The database connection interface used by query sessions
///
/// `query` returns once the statement has been accepted and its columns are
/// known; rows then arrive through the cursor. `cancel` is checked by the
/// producer before every row it fetches.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(&self, cancel: CancellationToken, sql: &str) -> Result<RowCursor>;
}
