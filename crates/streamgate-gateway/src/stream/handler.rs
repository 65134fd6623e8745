//! `/ws` upgrade endpoint

use super::protocol::Frame;
use super::Session;
use crate::http_api::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use streamgate_engine::QueryBackend;
use tracing::{debug, warn};

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close => Message::Close(None),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(bytes) => Frame::Binary(bytes),
            Message::Ping(payload) => Frame::Ping(payload),
            Message::Pong(payload) => Frame::Pong(payload),
            Message::Close(_) => Frame::Close,
        }
    }
}

/// Upgrade to a WebSocket and serve a streaming session on it
///
/// Any origin is accepted.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: AppState) {
    let backend: Arc<dyn QueryBackend> = state.executor.clone();
    let mut session = Session::new(backend, state.session_config.clone(), &state.shutdown);
    debug!(session_id = %session.id(), "WebSocket upgraded");

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<Message, axum::Error>(frame.into())));
    let inbound = stream.map(|message| message.map(Frame::from));

    if let Err(e) = session.run(sink, inbound).await {
        warn!(session_id = %session.id(), "Session failed: {}", e);
    }
    debug!(session_id = %session.id(), state = %session.state(), "WebSocket released");
}
