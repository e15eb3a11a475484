//! Tracing setup for poolkit-probe
//!
//! Environment variables:
//!   RUST_LOG      # Log filter (default: info, or debug with --debug)
//!
//! Production environments log one JSON object per line; everything else gets
//! the compact console format.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Tracing configuration options
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Enable debug logging (sets RUST_LOG=debug if not already set)
    pub debug: bool,
    /// Emit JSON lines instead of the console format
    pub json: bool,
}

impl TracingConfig {
    pub fn for_environment(environment: &str, debug: bool) -> Self {
        Self {
            debug,
            json: environment == "production",
        }
    }
}

pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(config.debug);

    if config.json {
        builder.json().try_init().map_err(|err| anyhow!(err))
    } else {
        builder.compact().try_init().map_err(|err| anyhow!(err))
    }
}
