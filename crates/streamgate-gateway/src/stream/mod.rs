//! WebSocket streaming sessions
//!
//! A client opens `/ws`, sends `query` and `cancelQuery` control messages and
//! receives each result as `metadata`, a run of `data` messages, and one
//! `complete` or `error`.

pub mod coercion;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod streamer;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SessionConfig;
pub use handler::ws_handler;
pub use session::Session;
