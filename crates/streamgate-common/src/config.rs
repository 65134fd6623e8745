//! Configuration utilities for streamgate services
//!
//! Every tunable is an environment variable with a compiled-in default, so a
//! deployment only sets what it needs to change.

use std::time::Duration;

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable holding whole seconds as a duration
pub fn env_duration_secs_or_default(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse_or_default(key, default_secs))
}
