//! Wire messages exchanged over the streaming WebSocket
//!
//! Inbound:
//! - `{"type":"query","query":"<sql>","streamId":"<id>"}`
//! - `{"type":"cancelQuery"}`
//!
//! Outbound:
//! - `{"type":"metadata","streamId":"<id>","data":{"columns":[...]}}`
//! - `{"type":"data","streamId":"<id>","data":[...]}`
//! - `{"type":"complete","streamId":"<id>","data":{"rows":N,"status":"completed"|"cancelled"}}`
//! - `{"type":"error","error":"<message>"}`
//!
//! `streamId` is omitted when empty.

use super::coercion::TransportValue;
use super::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Transport-level WebSocket frame, independent of the server framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Control message sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Query { query: String, stream_id: String },
    CancelQuery,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    query: String,
    #[serde(rename = "streamId", default)]
    stream_id: String,
}

impl ClientMessage {
    /// Decode one inbound payload
    ///
    /// Anything that is not a JSON object with correctly typed fields is
    /// `InvalidFormat`; a well-formed object with an unrecognized `type` is
    /// `UnknownType`.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|_| ProtocolError::InvalidFormat)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidFormat);
        }
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|_| ProtocolError::InvalidFormat)?;

        match envelope.kind.as_str() {
            "query" => Ok(ClientMessage::Query {
                query: envelope.query,
                stream_id: envelope.stream_id,
            }),
            "cancelQuery" => Ok(ClientMessage::CancelQuery),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Terminal status of a stream that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Cancelled,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataPayload {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletePayload {
    pub rows: u64,
    pub status: CompletionStatus,
}

/// Message pushed to the client through the outbound queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Metadata {
        #[serde(rename = "streamId", skip_serializing_if = "String::is_empty")]
        stream_id: String,
        data: MetadataPayload,
    },
    Data {
        #[serde(rename = "streamId", skip_serializing_if = "String::is_empty")]
        stream_id: String,
        data: Vec<TransportValue>,
    },
    Complete {
        #[serde(rename = "streamId", skip_serializing_if = "String::is_empty")]
        stream_id: String,
        data: CompletePayload,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn metadata(stream_id: &str, columns: Vec<String>) -> Self {
        ServerMessage::Metadata {
            stream_id: stream_id.to_string(),
            data: MetadataPayload { columns },
        }
    }

    pub fn data(stream_id: &str, row: Vec<TransportValue>) -> Self {
        ServerMessage::Data {
            stream_id: stream_id.to_string(),
            data: row,
        }
    }

    pub fn complete(stream_id: &str, rows: u64, status: CompletionStatus) -> Self {
        ServerMessage::Complete {
            stream_id: stream_id.to_string(),
            data: CompletePayload { rows, status },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    /// `complete` and `error` end a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::Complete { .. } | ServerMessage::Error { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
