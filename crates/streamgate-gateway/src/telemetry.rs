//! Logging setup
//!
//! Structured `tracing` output for the gateway. `RUST_LOG` takes precedence
//! over the configured level; `JSON_LOGS=true` switches to JSON lines.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let json_logs = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}
