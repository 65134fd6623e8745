//! Per-session tunables

use std::time::Duration;
use streamgate_common::{env_duration_secs_or_default, env_parse_or_default, StreamgateError};
use tracing::info;

/// Streaming session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded outbound queue size; a full queue blocks the row streamer
    pub outbound_queue_capacity: usize,
    /// Idle time after which the writer sends a keepalive ping
    pub ping_interval: Duration,
    /// Read timeout the peer applies while waiting for our pings
    pub pong_wait: Duration,
    /// Deadline for a single frame write
    pub write_timeout: Duration,
    /// Inbound frames above this size are rejected as malformed
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// Load from `STREAMGATE_WS_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            outbound_queue_capacity: env_parse_or_default(
                "STREAMGATE_WS_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            ),
            ping_interval: env_duration_secs_or_default(
                "STREAMGATE_WS_PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            ),
            pong_wait: env_duration_secs_or_default(
                "STREAMGATE_WS_PONG_WAIT_SECS",
                defaults.pong_wait.as_secs(),
            ),
            write_timeout: env_duration_secs_or_default(
                "STREAMGATE_WS_WRITE_TIMEOUT_SECS",
                defaults.write_timeout.as_secs(),
            ),
            max_message_bytes: env_parse_or_default(
                "STREAMGATE_WS_MAX_MESSAGE_BYTES",
                defaults.max_message_bytes,
            ),
        }
    }

    /// Reject settings that would break keepalive or stall every session
    pub fn validate(&self) -> Result<(), StreamgateError> {
        if self.outbound_queue_capacity == 0 {
            return Err(StreamgateError::ConfigError(
                "outbound queue capacity must be at least 1".into(),
            ));
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.pong_wait {
            return Err(StreamgateError::ConfigError(format!(
                "ping interval ({:?}) must be non-zero and shorter than pong wait ({:?})",
                self.ping_interval, self.pong_wait
            )));
        }
        if self.write_timeout.is_zero() {
            return Err(StreamgateError::ConfigError(
                "write timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!(
            "Session config: queue={}, ping={:?}, pong_wait={:?}, write_timeout={:?}, max_message={}B",
            self.outbound_queue_capacity,
            self.ping_interval,
            self.pong_wait,
            self.write_timeout,
            self.max_message_bytes
        );
    }
}
