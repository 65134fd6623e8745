//! Session writer
//!
//! The only task that touches the outgoing half of the connection. Messages
//! from the outbound queue go out in FIFO order, one frame each; a ping goes
//! out whenever nothing was written for a full ping interval. Every write is
//! bounded by the write timeout.

use super::config::SessionConfig;
use super::error::SessionError;
use super::protocol::{Frame, ServerMessage};
use futures::{Sink, SinkExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Producer handle for a session's outbound queue
///
/// `push` waits while the queue is full, which is what slows a row streamer
/// down to the pace of the client.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerMessage>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Outbound, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Outbound { tx }, rx)
    }

    /// Queue a message; fails once the writer has stopped
    pub async fn push(&self, message: ServerMessage) -> Result<(), SessionError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SessionError::transport("outbound queue closed"))
    }

    pub async fn error(&self, message: impl Into<String>) -> Result<(), SessionError> {
        self.push(ServerMessage::error(message)).await
    }
}

pub struct SessionWriter<S> {
    sink: S,
    queue: mpsc::Receiver<ServerMessage>,
    config: SessionConfig,
    /// Session root; cancelled here when the connection fails
    root: CancellationToken,
    /// Cancelled by the session to force drain-and-close
    closing: CancellationToken,
    session_id: String,
}

impl<S> SessionWriter<S>
where
    S: Sink<Frame> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(
        sink: S,
        queue: mpsc::Receiver<ServerMessage>,
        config: SessionConfig,
        root: CancellationToken,
        closing: CancellationToken,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            queue,
            config,
            root,
            closing,
            session_id: session_id.into(),
        }
    }

    /// Run until the queue closes, the session forces close, or a write fails
    pub async fn run(mut self) -> Result<(), SessionError> {
        debug!(session_id = %self.session_id, "Writer started");
        let result = self.pump().await;
        if let Err(e) = &result {
            warn!(session_id = %self.session_id, error = %e, "Writer failed, tearing down session");
            self.root.cancel();
        }
        debug!(session_id = %self.session_id, "Writer stopped");
        result
    }

    async fn pump(&mut self) -> Result<(), SessionError> {
        let mut idle_deadline = Instant::now() + self.config.ping_interval;

        loop {
            tokio::select! {
                biased;

                message = self.queue.recv() => match message {
                    Some(message) => self.write_message(message).await?,
                    None => {
                        debug!(session_id = %self.session_id, "Outbound queue closed, sending close");
                        self.send_close().await;
                        return Ok(());
                    }
                },

                _ = self.closing.cancelled() => {
                    self.queue.close();
                    while let Ok(message) = self.queue.try_recv() {
                        self.write_message(message).await?;
                    }
                    debug!(session_id = %self.session_id, "Session closing, sending close");
                    self.send_close().await;
                    return Ok(());
                }

                _ = sleep_until(idle_deadline) => {
                    trace!(session_id = %self.session_id, "Sending keepalive ping");
                    self.write(Frame::Ping(Vec::new())).await?;
                }
            }

            idle_deadline = Instant::now() + self.config.ping_interval;
        }
    }

    async fn write_message(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        match message.to_json() {
            Ok(text) => {
                if message.is_terminal() {
                    debug!(session_id = %self.session_id, message = %text, "Sending terminal message");
                } else {
                    trace!(session_id = %self.session_id, message = %text, "Sending message");
                }
                self.write(Frame::Text(text)).await
            }
            Err(e) => {
                error!(session_id = %self.session_id, "Error marshaling message: {}", e);
                Ok(())
            }
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), SessionError> {
        match timeout(self.config.write_timeout, self.sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::transport(e)),
            Err(_) => Err(SessionError::transport(format!(
                "write timed out after {:?}",
                self.config.write_timeout
            ))),
        }
    }

    /// Best effort; the connection may already be gone
    async fn send_close(&mut self) {
        if let Err(e) = self.write(Frame::Close).await {
            debug!(session_id = %self.session_id, "Close frame not delivered: {}", e);
        }
    }
}
