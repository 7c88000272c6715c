//! Runtime Configuration Module
//!
//! Loads node configuration from a TOML file, an optional
//! environment-specific overlay, and `TOKENFLOW__`-prefixed environment
//! variables (`TOKENFLOW__QUEUE__DEFAULT_LENGTH=8`). Every section has
//! defaults, so an empty file is a valid configuration.

use crate::defaults;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

static DEFAULT_CONFIG: Lazy<RuntimeConfig> = Lazy::new(RuntimeConfig::default);

/// Main runtime configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub node: NodeSettings,
    pub queue: QueueSettings,
    pub scheduler: SchedulerSettings,
    pub tunnel: TunnelSettings,
    pub connection: ConnectionSettings,
    pub migration: MigrationSettings,
}

/// Node identity and logging
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NodeSettings {
    /// Fixed node id; generated when absent
    pub id: Option<String>,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub default_length: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_length: defaults::queue::DEFAULT_QUEUE_LENGTH,
        }
    }
}

/// Scheduler policy selection
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStrategy {
    /// Fire every enabled actor under a time budget, then communicate
    #[default]
    Simple,
    /// Fire each enabled actor at most once per pass
    RoundRobin,
    /// Drive a firing actor until it stops making progress
    NonPreemptive,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub strategy: SchedulerStrategy,
    pub fire_budget_ms: u64,
    pub watchdog_secs: u64,
    pub maintenance_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            strategy: SchedulerStrategy::Simple,
            fire_budget_ms: defaults::scheduler::FIRE_BUDGET_MS,
            watchdog_secs: defaults::scheduler::WATCHDOG_SECS,
            maintenance_secs: defaults::scheduler::MAINTENANCE_SECS,
        }
    }
}

impl SchedulerSettings {
    pub fn fire_budget(&self) -> Duration {
        Duration::from_millis(self.fire_budget_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn maintenance_period(&self) -> Duration {
        Duration::from_secs(self.maintenance_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: defaults::tunnel::BACKOFF_INITIAL_MS,
            backoff_max_ms: defaults::tunnel::BACKOFF_MAX_MS,
            inbox_capacity: defaults::tunnel::INBOX_CAPACITY,
        }
    }
}

impl TunnelSettings {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub gone_retries: u32,
    pub relocate_retries: u32,
    /// How long a request to a peer waits for its reply
    pub reply_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            gone_retries: defaults::connection::GONE_RETRIES,
            relocate_retries: defaults::connection::RELOCATE_RETRIES,
            reply_timeout_ms: defaults::connection::REPLY_TIMEOUT_MS,
        }
    }
}

impl ConnectionSettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MigrationSettings {
    pub timeout_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::migration::TIMEOUT_SECS,
        }
    }
}

impl MigrationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RuntimeConfig {
    /// Shared default configuration
    pub fn defaults() -> &'static RuntimeConfig {
        &DEFAULT_CONFIG
    }

    /// Load configuration from files with environment overrides
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/runtime.toml"));

        let mut builder = Config::builder().add_source(File::from(base).required(base_path.is_some()));

        // Add environment-specific overrides if specified
        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or(Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Override with environment variables (TOKENFLOW__ prefix)
        builder = builder.add_source(
            Environment::with_prefix("TOKENFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Render as TOML, e.g. to seed a configuration file
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }

    pub fn node_id_or_generate(&self, generate: impl FnOnce() -> String) -> String {
        self.node.id.clone().unwrap_or_else(generate)
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(path: Option<PathBuf>, environment: Option<&str>) -> Result<RuntimeConfig> {
    RuntimeConfig::load(path.as_deref(), environment)
}
