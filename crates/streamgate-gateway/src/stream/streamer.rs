//! Row streamer
//!
//! Runs one query and turns its result into `metadata`, `data`... and exactly
//! one terminal `complete` or `error` message. Cancellation is observed while
//! the query is being submitted, before each row fetch, while waiting on the
//! fetch, and after each emitted row. A query cancelled before its columns are
//! known ends with `complete` alone.
//! The cursor is owned by [`RowStreamer::execute`] and released on every
//! return path.

use super::coercion::CoercionPlan;
use super::error::SessionError;
use super::protocol::{CompletionStatus, ServerMessage};
use super::writer::Outbound;
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;
use streamgate_common::StreamgateError;
use streamgate_engine::QueryBackend;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RowStreamer {
    backend: Arc<dyn QueryBackend>,
    outbound: Outbound,
    session_id: String,
}

impl RowStreamer {
    pub fn new(backend: Arc<dyn QueryBackend>, outbound: Outbound, session_id: impl Into<String>) -> Self {
        Self {
            backend,
            outbound,
            session_id: session_id.into(),
        }
    }

    /// Stream one query into the outbound queue
    ///
    /// All results, failures included, are delivered as messages.
    pub async fn stream(&self, cancel: CancellationToken, query: &str, stream_id: &str) {
        let started = Instant::now();
        info!(
            session_id = %self.session_id,
            stream_id = %stream_id,
            query = %log_preview(query),
            "Streaming query"
        );

        let mut rows: u64 = 0;
        let status = match self.execute(&cancel, query, stream_id, &mut rows).await {
            Ok(status) => status.as_str(),
            Err(e) if e.is_fatal() => {
                debug!(
                    session_id = %self.session_id,
                    stream_id = %stream_id,
                    rows,
                    "Connection gone, abandoning stream"
                );
                "abandoned"
            }
            Err(e) => {
                warn!(session_id = %self.session_id, stream_id = %stream_id, rows, error = %e, "Query stream failed");
                if self.outbound.error(e.to_string()).await.is_err() {
                    debug!(session_id = %self.session_id, "Error message not delivered, writer stopped");
                }
                "errored"
            }
        };

        let elapsed = started.elapsed();
        metrics::record_rows_streamed(rows);
        metrics::record_streamed_query(status, elapsed.as_secs_f64());
        info!(
            session_id = %self.session_id,
            stream_id = %stream_id,
            rows,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Query stream finished"
        );
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        query: &str,
        stream_id: &str,
        rows: &mut u64,
    ) -> Result<CompletionStatus, SessionError> {
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.backend.query(cancel.clone(), query) => Some(result),
        };
        let mut cursor = match submitted {
            None | Some(Err(StreamgateError::QueryCancelled)) => {
                return self.finish(stream_id, 0, CompletionStatus::Cancelled).await
            }
            Some(Ok(cursor)) => cursor,
            Some(Err(e)) => return Err(SessionError::submit(e.detail())),
        };

        let plan = CoercionPlan::new(cursor.columns());
        self.outbound
            .push(ServerMessage::metadata(stream_id, plan.column_names()))
            .await?;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = cursor.next_row() => Some(next),
            };

            let row = match fetched {
                None => return self.finish(stream_id, *rows, CompletionStatus::Cancelled).await,
                Some(Ok(Some(row))) => row,
                Some(Ok(None)) => break,
                Some(Err(e)) => return Err(SessionError::fetch(e.detail())),
            };

            let values = plan.coerce_row(row).map_err(SessionError::scan)?;
            self.outbound
                .push(ServerMessage::data(stream_id, values))
                .await?;
            *rows += 1;

            if cancel.is_cancelled() {
                return self.finish(stream_id, *rows, CompletionStatus::Cancelled).await;
            }
        }

        self.finish(stream_id, *rows, CompletionStatus::Completed).await
    }

    async fn finish(
        &self,
        stream_id: &str,
        rows: u64,
        status: CompletionStatus,
    ) -> Result<CompletionStatus, SessionError> {
        self.outbound
            .push(ServerMessage::complete(stream_id, rows, status))
            .await?;
        Ok(status)
    }
}

/// First 200 characters of a query, for log lines
fn log_preview(query: &str) -> &str {
    match query.char_indices().nth(200) {
        Some((idx, _)) => &query[..idx],
        None => query,
    }
}
