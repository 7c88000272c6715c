//! # Tokenflow Configuration
//!
//! Runtime configuration and constant defaults for tokenflow nodes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flow_config::{defaults, RuntimeConfig};
//!
//! let config = RuntimeConfig::load(None, Some("staging")).unwrap();
//! assert!(config.queue.default_length >= 1);
//! let _ = defaults::tunnel::TOKEN_TUNNEL_TYPE;
//! ```

pub mod defaults;
pub mod runtime_config;

// Re-export commonly used types
pub use runtime_config::{
    load_config, ConnectionSettings, MigrationSettings, NodeSettings, QueueSettings, RuntimeConfig,
    SchedulerSettings, SchedulerStrategy, TunnelSettings,
};
