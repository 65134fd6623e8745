//! Session error taxonomy
//!
//! Protocol and execution errors are reported to the client as `error`
//! messages and the session carries on. Transport errors end the session.

use std::fmt;

/// Rejected inbound message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type")]
    UnknownType(String),
}

impl ProtocolError {
    /// Label for the protocol error counter
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::InvalidFormat => "invalid_format",
            ProtocolError::UnknownType(_) => "unknown_type",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Query submission or row failure; the text is client-facing
    #[error("{0}")]
    Execution(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session already started")]
    AlreadyStarted,
}

impl SessionError {
    pub fn submit<E: fmt::Display>(cause: E) -> Self {
        SessionError::Execution(format!("Query error: {}", cause))
    }

    pub fn scan<E: fmt::Display>(cause: E) -> Self {
        SessionError::Execution(format!("Row scan error: {}", cause))
    }

    pub fn fetch<E: fmt::Display>(cause: E) -> Self {
        SessionError::Execution(format!("Row iteration error: {}", cause))
    }

    pub fn transport<E: fmt::Display>(cause: E) -> Self {
        SessionError::Transport(cause.to_string())
    }

    /// Only transport failures end the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}
