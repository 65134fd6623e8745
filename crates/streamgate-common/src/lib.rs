//! Streamgate Common Library
//!
//! Shared error type and configuration helpers for the streamgate crates.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{env_duration_secs_or_default, env_or_default, env_parse_or_default};
pub use error::{Result, StreamgateError};
