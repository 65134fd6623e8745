//! Session reader and protocol dispatcher
//!
//! Owns the inbound half of the connection and the cancellation handle of the
//! current query. A new query cancels the previous one and is started on its
//! own task; the task first waits for the superseded streamer to wind down, so
//! at most one streamer runs per session and the old stream's terminal message
//! is queued before the new stream's metadata.

use super::config::SessionConfig;
use super::error::ProtocolError;
use super::protocol::{ClientMessage, Frame};
use super::streamer::RowStreamer;
use super::writer::Outbound;
use crate::metrics;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub struct SessionReader {
    streamer: Arc<RowStreamer>,
    outbound: Outbound,
    root: CancellationToken,
    config: SessionConfig,
    session_id: String,
    /// Cancellation handle of the most recent query, cleared by `cancelQuery`
    active: Option<CancellationToken>,
    /// Task of the most recently started streamer
    last_stream: Option<JoinHandle<()>>,
}

impl SessionReader {
    pub fn new(
        streamer: Arc<RowStreamer>,
        outbound: Outbound,
        root: CancellationToken,
        config: SessionConfig,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            streamer,
            outbound,
            root,
            config,
            session_id: session_id.into(),
            active: None,
            last_stream: None,
        }
    }

    /// Consume inbound frames until the peer leaves, a read fails, or the
    /// session is cancelled
    pub async fn run<R, E>(&mut self, mut inbound: R)
    where
        R: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.root.cancelled() => {
                    debug!(session_id = %self.session_id, "Session cancelled, reader stopping");
                    break;
                }
                frame = inbound.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    if !self.handle_frame(frame).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    info!(session_id = %self.session_id, "Error reading message: {}", e);
                    break;
                }
                None => {
                    debug!(session_id = %self.session_id, "Inbound stream ended");
                    break;
                }
            }
        }
    }

    /// Returns false when the session should end
    async fn handle_frame(&mut self, frame: Frame) -> bool {
        let payload = match frame {
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(bytes) => bytes,
            // The server framework answers pings itself
            Frame::Ping(_) => return true,
            Frame::Pong(_) => {
                trace!(session_id = %self.session_id, "Pong received");
                return true;
            }
            Frame::Close => {
                debug!(session_id = %self.session_id, "Close frame received");
                return false;
            }
        };

        if payload.len() > self.config.max_message_bytes {
            warn!(
                session_id = %self.session_id,
                size = payload.len(),
                limit = self.config.max_message_bytes,
                "Inbound message too large"
            );
            return self.reject(ProtocolError::InvalidFormat).await;
        }

        match ClientMessage::decode(&payload) {
            Ok(ClientMessage::Query { query, stream_id }) => {
                self.start_query(query, stream_id);
                true
            }
            Ok(ClientMessage::CancelQuery) => {
                self.cancel_active();
                true
            }
            Err(e) => self.reject(e).await,
        }
    }

    /// Report a protocol error; false only if the writer is gone
    async fn reject(&self, error: ProtocolError) -> bool {
        match &error {
            ProtocolError::UnknownType(kind) => {
                debug!(session_id = %self.session_id, message_type = %kind, "Unknown message type")
            }
            ProtocolError::InvalidFormat => debug!(session_id = %self.session_id, "Malformed message"),
        }
        metrics::record_protocol_error(error.kind());
        self.outbound.error(error.to_string()).await.is_ok()
    }

    fn start_query(&mut self, query: String, stream_id: String) {
        if let Some(previous) = self.active.take() {
            debug!(session_id = %self.session_id, "Superseding running query");
            previous.cancel();
        }

        let cancel = self.root.child_token();
        self.active = Some(cancel.clone());

        let previous = self.last_stream.take();
        let streamer = self.streamer.clone();
        let session_id = self.session_id.clone();
        self.last_stream = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(session_id = %session_id, "Superseded stream task failed: {}", e);
                }
            }
            streamer.stream(cancel, &query, &stream_id).await;
        }));
    }

    fn cancel_active(&mut self) {
        match self.active.take() {
            Some(cancel) => {
                debug!(session_id = %self.session_id, "Cancelling active query");
                cancel.cancel();
            }
            None => trace!(session_id = %self.session_id, "Cancel with no active query"),
        }
    }

    /// Task of the last started streamer, for teardown
    pub fn take_last_stream(&mut self) -> Option<JoinHandle<()>> {
        self.last_stream.take()
    }
}
