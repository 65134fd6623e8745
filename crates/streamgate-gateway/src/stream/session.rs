//! Streaming session
//!
//! One session per accepted WebSocket connection. The session spawns the
//! writer, runs the reader on the calling task, and tears everything down
//! when the reader stops: running queries are cancelled, their cursors are
//! released, queued messages are flushed and the connection is closed.

use super::config::SessionConfig;
use super::error::SessionError;
use super::protocol::Frame;
use super::reader::SessionReader;
use super::streamer::RowStreamer;
use super::writer::{Outbound, SessionWriter};
use crate::metrics;
use futures::{Sink, Stream};
use std::fmt::{self, Display};
use std::sync::Arc;
use streamgate_engine::QueryBackend;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Session {
    id: String,
    backend: Arc<dyn QueryBackend>,
    config: SessionConfig,
    /// Cancelled on teardown; every query token is a child of it
    root: CancellationToken,
    state: SessionState,
}

impl Session {
    /// `parent` is the server's shutdown token
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        config: SessionConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            backend,
            config,
            root: parent.child_token(),
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until the peer leaves, the connection breaks, or
    /// the server shuts down
    pub async fn run<S, R, E>(&mut self, sink: S, inbound: R) -> Result<(), SessionError>
    where
        S: Sink<Frame> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        if self.state != SessionState::Connecting {
            return Err(SessionError::AlreadyStarted);
        }

        let (outbound, queue) = Outbound::channel(self.config.outbound_queue_capacity);
        let closing = CancellationToken::new();
        let writer = SessionWriter::new(
            sink,
            queue,
            self.config.clone(),
            self.root.clone(),
            closing.clone(),
            self.id.clone(),
        );
        let writer_task = tokio::spawn(writer.run());

        let streamer = Arc::new(RowStreamer::new(
            self.backend.clone(),
            outbound.clone(),
            self.id.clone(),
        ));
        let mut reader = SessionReader::new(
            streamer,
            outbound,
            self.root.clone(),
            self.config.clone(),
            self.id.clone(),
        );

        self.state = SessionState::Active;
        metrics::session_opened();
        info!(session_id = %self.id, "Session opened");

        reader.run(inbound).await;

        self.state = SessionState::Closing;
        debug!(session_id = %self.id, "Session closing");
        self.root.cancel();

        if let Some(mut last_stream) = reader.take_last_stream() {
            if timeout(self.config.write_timeout, &mut last_stream).await.is_err() {
                warn!(session_id = %self.id, "Query stream did not stop in time, aborting");
                last_stream.abort();
            }
        }

        // Last producer handles go with the reader
        drop(reader);
        closing.cancel();
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session_id = %self.id, "Writer ended with error: {}", e),
            Err(e) => warn!(session_id = %self.id, "Writer task failed: {}", e),
        }

        self.state = SessionState::Closed;
        metrics::session_closed();
        info!(session_id = %self.id, "Session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{Script, ScriptedBackend};
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::io;
    use std::time::Duration;
    use streamgate_engine::{ColumnDescriptor, RawValue};
    use tokio::task::JoinHandle;

    type Inbound = fmpsc::UnboundedSender<Result<Frame, io::Error>>;

    struct Harness {
        inbound: Option<Inbound>,
        frames: fmpsc::UnboundedReceiver<Frame>,
        handle: JoinHandle<(Session, Result<(), SessionError>)>,
    }

    impl Harness {
        fn start(backend: Arc<ScriptedBackend>, config: SessionConfig, parent: &CancellationToken) -> Self {
            let (inbound, inbound_rx) = fmpsc::unbounded();
            let (sink, frames) = fmpsc::unbounded::<Frame>();
            let mut session = Session::new(backend, config, parent);
            let handle = tokio::spawn(async move {
                let result = session.run(sink, inbound_rx).await;
                (session, result)
            });
            Self {
                inbound: Some(inbound),
                frames,
                handle,
            }
        }

        fn send(&self, text: &str) {
            self.inbound
                .as_ref()
                .unwrap()
                .unbounded_send(Ok(Frame::Text(text.to_string())))
                .unwrap();
        }

        fn query(&self, sql: &str, stream_id: &str) {
            self.send(&json!({"type": "query", "query": sql, "streamId": stream_id}).to_string());
        }

        fn hang_up(&mut self) {
            self.inbound = None;
        }

        /// Next text message, skipping keepalive pings
        async fn next_message(&mut self) -> Value {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("connection closed");
                match frame {
                    Frame::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Frame::Ping(_) => continue,
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        }

        /// Drain frames up to and including the close frame
        async fn until_close(&mut self) -> Vec<Value> {
            let mut messages = Vec::new();
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
                    .await
                    .expect("timed out waiting for close");
                match frame {
                    Some(Frame::Text(text)) => messages.push(serde_json::from_str(&text).unwrap()),
                    Some(Frame::Close) | None => return messages,
                    Some(_) => {}
                }
            }
        }

        async fn finish(self) -> (Session, Result<(), SessionError>) {
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("session did not stop")
                .unwrap()
        }
    }

    fn select_one() -> Script {
        Script::rows(
            vec![ColumnDescriptor::new("1", "Int32")],
            vec![vec![RawValue::Signed(1)]],
        )
    }

    #[tokio::test]
    async fn test_query_streams_to_completion() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT 1", select_one());
        let mut harness = Harness::start(backend.clone(), SessionConfig::default(), &CancellationToken::new());

        harness.query("SELECT 1", "a");
        assert_eq!(
            harness.next_message().await,
            json!({"type": "metadata", "streamId": "a", "data": {"columns": ["1"]}})
        );
        assert_eq!(
            harness.next_message().await,
            json!({"type": "data", "streamId": "a", "data": [1]})
        );
        assert_eq!(
            harness.next_message().await,
            json!({"type": "complete", "streamId": "a", "data": {"rows": 1, "status": "completed"}})
        );

        harness.hang_up();
        assert!(harness.until_close().await.is_empty());
        let (session, result) = harness.finish().await;
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.wait_released(1).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_reports_rows_sent() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT * FROM numbers", Script::endless());
        let mut harness = Harness::start(backend.clone(), SessionConfig::default(), &CancellationToken::new());

        harness.query("SELECT * FROM numbers", "q1");
        assert_eq!(harness.next_message().await["type"], "metadata");
        for _ in 0..3 {
            assert_eq!(harness.next_message().await["type"], "data");
        }
        harness.send(r#"{"type":"cancelQuery"}"#);

        let mut data_rows = 3;
        let complete = loop {
            let message = harness.next_message().await;
            match message["type"].as_str() {
                Some("data") => data_rows += 1,
                Some("complete") => break message,
                other => panic!("unexpected message type {:?}", other),
            }
        };
        assert_eq!(complete["streamId"], "q1");
        assert_eq!(complete["data"]["status"], "cancelled");
        assert_eq!(complete["data"]["rows"], data_rows);
        assert_eq!(backend.wait_released(1).await, 1);
    }

    #[tokio::test]
    async fn test_new_query_supersedes_running_one() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT * FROM numbers", Script::endless());
        backend.script("SELECT 1", select_one());
        let mut harness = Harness::start(backend.clone(), SessionConfig::default(), &CancellationToken::new());

        harness.query("SELECT * FROM numbers", "a");
        assert_eq!(harness.next_message().await["type"], "metadata");
        harness.query("SELECT 1", "b");

        let mut seen = Vec::new();
        loop {
            let message = harness.next_message().await;
            let done = message["type"] == "complete" && message["streamId"] == "b";
            seen.push(message);
            if done {
                break;
            }
        }

        let a_complete = seen
            .iter()
            .position(|m| m["type"] == "complete" && m["streamId"] == "a")
            .expect("superseded stream must complete");
        let b_metadata = seen
            .iter()
            .position(|m| m["type"] == "metadata" && m["streamId"] == "b")
            .expect("new stream must start");
        assert!(a_complete < b_metadata);
        assert_eq!(seen[a_complete]["data"]["status"], "cancelled");
        assert!(seen[b_metadata..].iter().all(|m| m["streamId"] == "b"));
        assert_eq!(seen.last().unwrap()["data"]["status"], "completed");
    }

    #[tokio::test]
    async fn test_cancel_without_active_query_is_ignored() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT 1", select_one());
        let mut harness = Harness::start(backend, SessionConfig::default(), &CancellationToken::new());

        harness.send(r#"{"type":"cancelQuery"}"#);
        harness.query("SELECT 1", "a");
        assert_eq!(harness.next_message().await["type"], "metadata");
    }

    #[tokio::test]
    async fn test_bad_messages_keep_session_open() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT 1", select_one());
        let mut harness = Harness::start(backend, SessionConfig::default(), &CancellationToken::new());

        harness.send("not json at all");
        assert_eq!(
            harness.next_message().await,
            json!({"type": "error", "error": "Invalid message format"})
        );
        harness.send(r#"{"type":"subscribe","topic":"x"}"#);
        assert_eq!(
            harness.next_message().await,
            json!({"type": "error", "error": "Unknown message type"})
        );

        harness.query("SELECT 1", "a");
        assert_eq!(harness.next_message().await["type"], "metadata");
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        let config = SessionConfig {
            max_message_bytes: 64,
            ..SessionConfig::default()
        };
        let mut harness = Harness::start(backend, config, &CancellationToken::new());

        harness.query(&format!("SELECT '{}'", "x".repeat(100)), "a");
        assert_eq!(
            harness.next_message().await,
            json!({"type": "error", "error": "Invalid message format"})
        );
    }

    #[tokio::test]
    async fn test_submit_failure_is_single_error() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELEC 1", Script::submit_error("Parser Error: syntax error at or near \"SELEC\""));
        backend.script("SELECT 1", select_one());
        let mut harness = Harness::start(backend, SessionConfig::default(), &CancellationToken::new());

        harness.query("SELEC 1", "a");
        assert_eq!(
            harness.next_message().await,
            json!({"type": "error", "error": "Query error: Parser Error: syntax error at or near \"SELEC\""})
        );
        harness.query("SELECT 1", "b");
        assert_eq!(harness.next_message().await["streamId"], "b");
    }

    #[tokio::test]
    async fn test_empty_result_completes_with_zero_rows() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            "SELECT * FROM t WHERE false",
            Script::rows(vec![ColumnDescriptor::new("id", "Int64")], vec![]),
        );
        let mut harness = Harness::start(backend, SessionConfig::default(), &CancellationToken::new());

        harness.query("SELECT * FROM t WHERE false", "");
        assert_eq!(
            harness.next_message().await,
            json!({"type": "metadata", "data": {"columns": ["id"]}})
        );
        assert_eq!(
            harness.next_message().await,
            json!({"type": "complete", "data": {"rows": 0, "status": "completed"}})
        );
    }

    #[tokio::test]
    async fn test_peer_hang_up_releases_running_query() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT * FROM numbers", Script::endless());
        let mut harness = Harness::start(backend.clone(), SessionConfig::default(), &CancellationToken::new());

        harness.query("SELECT * FROM numbers", "a");
        assert_eq!(harness.next_message().await["type"], "metadata");
        harness.hang_up();

        let trailing = harness.until_close().await;
        if let Some(last) = trailing.last() {
            assert_eq!(last["type"], "complete");
            assert_eq!(last["data"]["status"], "cancelled");
        }
        let (session, result) = harness.finish().await;
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.wait_released(1).await, 1);
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_session() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT * FROM numbers", Script::endless());
        let shutdown = CancellationToken::new();
        let mut harness = Harness::start(backend.clone(), SessionConfig::default(), &shutdown);

        harness.query("SELECT * FROM numbers", "a");
        assert_eq!(harness.next_message().await["type"], "metadata");
        shutdown.cancel();

        harness.until_close().await;
        let (session, result) = harness.finish().await;
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.wait_released(1).await, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_ends_session() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("SELECT * FROM numbers", Script::endless());
        let harness = Harness::start(backend.clone(), SessionConfig::default(), &CancellationToken::new());

        harness.query("SELECT * FROM numbers", "a");
        let Harness { inbound, frames, handle } = harness;
        drop(frames);

        let (session, result) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not stop")
            .unwrap();
        drop(inbound);
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(backend.wait_released(1).await, 1);
    }

    #[tokio::test]
    async fn test_session_runs_once() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut harness = Harness::start(backend, SessionConfig::default(), &CancellationToken::new());
        harness.hang_up();
        let (mut session, _) = harness.finish().await;

        let (sink, _frames) = fmpsc::unbounded::<Frame>();
        let (_tx, rx) = fmpsc::unbounded::<Result<Frame, io::Error>>();
        assert!(matches!(
            session.run(sink, rx).await,
            Err(SessionError::AlreadyStarted)
        ));
        assert!(!session.id().is_empty());
    }
}
