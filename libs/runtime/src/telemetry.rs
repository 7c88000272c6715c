//! Tracing subscriber setup for node binaries

use crate::error::{Result, RuntimeError};
use flow_config::NodeSettings;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(settings: &NodeSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| RuntimeError::configuration(e.to_string(), Some("node.log_level")))?;

    let installed = if settings.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    installed.map_err(|e| RuntimeError::configuration(e.to_string(), None))
}
