//! Scripted query backend for session tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamgate_common::{Result, StreamgateError};
use streamgate_engine::{ColumnDescriptor, QueryBackend, RawRow, RawValue, RowCursor, RowSender};
use tokio_util::sync::CancellationToken;

/// Canned behaviour for one query text
#[derive(Debug, Clone, Default)]
pub struct Script {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<RawRow>,
    submit_error: Option<String>,
    fetch_error: Option<String>,
    endless: bool,
    submit_delay: Option<Duration>,
}

impl Script {
    pub fn rows(columns: Vec<ColumnDescriptor>, rows: Vec<RawRow>) -> Self {
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    /// `number UInt64` counting up until cancelled or released
    pub fn endless() -> Self {
        Self {
            columns: vec![ColumnDescriptor::new("number", "UInt64")],
            endless: true,
            ..Self::default()
        }
    }

    pub fn submit_error(message: &str) -> Self {
        Self {
            submit_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Take `delay` to accept the query, then yield no rows
    pub fn slow_submit(delay: Duration) -> Self {
        Self {
            columns: vec![ColumnDescriptor::new("n", "Int64")],
            submit_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the fetch after the scripted rows
    pub fn then_fail(mut self, message: &str) -> Self {
        self.fetch_error = Some(message.to_string());
        self
    }
}

#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Script>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, sql: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(sql.to_string(), script);
    }

    /// Cursors released so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Wait up to five seconds for at least `expected` released cursors
    pub async fn wait_released(&self, expected: usize) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.released() < expected && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.released()
    }
}

#[async_trait]
impl QueryBackend for ScriptedBackend {
    async fn query(&self, cancel: CancellationToken, sql: &str) -> Result<RowCursor> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .ok_or_else(|| StreamgateError::query(format!("no script for '{}'", sql)))?;
        if let Some(delay) = script.submit_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &script.submit_error {
            return Err(StreamgateError::query(message));
        }

        let released = self.released.clone();
        let (tx, cursor) = RowCursor::channel(script.columns.clone(), 1);
        tokio::spawn(produce(script, cancel, tx));
        Ok(cursor.on_release(move |_| {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

async fn produce(script: Script, cancel: CancellationToken, tx: RowSender) {
    if script.endless {
        let mut n: u64 = 0;
        while !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if tx.send(Ok(vec![RawValue::Unsigned(n)])).await.is_err() {
                return;
            }
            n += 1;
        }
        return;
    }

    for row in script.rows {
        if cancel.is_cancelled() || tx.send(Ok(row)).await.is_err() {
            return;
        }
    }
    if let Some(message) = script.fetch_error {
        let _ = tx.send(Err(StreamgateError::query(message))).await;
    }
}
