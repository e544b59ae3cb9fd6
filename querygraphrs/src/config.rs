//! Configuration for querygraph.
//!
//! TOML-based, with global defaults and per-connection overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueryGraphError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryGraphConfig {
    /// Global defaults applied to every connection unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-connection overrides keyed by connection id.
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub validation: ValidationConfig,
    pub warehouse: WarehouseConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Statement timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Row limit applied when a request does not give one (0 = none).
    pub default_row_limit: u64,
    /// Upper bound for any row limit (0 = unlimited).
    pub max_row_limit: u64,
}

/// Cardinality validation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Attach composite key decode warnings to validation results (default: true).
    pub warn_on_undecodable_keys: bool,
}

/// Statement execution API polling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Server-side wait before a statement returns PENDING (5..=50, default: 30).
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Polls before giving up on a running statement (default: 600).
    pub max_poll_attempts: u32,
}

/// Per-connection configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub query: Option<QueryConfig>,
    pub warehouse: Option<WarehouseConfig>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            default_row_limit: 0,
            max_row_limit: 0,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            warn_on_undecodable_keys: true,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 30,
            poll_interval_ms: 500,
            max_poll_attempts: 600,
        }
    }
}

impl QueryConfig {
    /// The requested limit (or the default), capped by `max_row_limit`.
    pub fn effective_row_limit(&self, requested: Option<u64>) -> Option<u64> {
        let limit = requested.unwrap_or(self.default_row_limit);
        let capped = if self.max_row_limit > 0 {
            limit.min(self.max_row_limit)
        } else {
            limit
        };
        (capped > 0).then_some(capped)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WarehouseConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl QueryGraphConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| QueryGraphError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| QueryGraphError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations.
    ///
    /// Search order:
    /// 1. `QUERYGRAPH_CONFIG` environment variable
    /// 2. `./querygraph.toml`
    /// 3. `<user config dir>/querygraph/config.toml`
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("QUERYGRAPH_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from QUERYGRAPH_CONFIG");
                    return cfg;
                }
                Err(err) => tracing::warn!(path = %path, error = %err, "ignoring QUERYGRAPH_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("querygraph.toml") {
            tracing::info!("loaded config from ./querygraph.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("querygraph").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Resolved settings for one connection (overrides merged over defaults).
    pub fn for_connection(&self, connection_id: &str) -> ResolvedConnectionConfig {
        ResolvedConnectionConfig::merge(&self.defaults, self.connections.get(connection_id))
    }
}

/// Fully resolved configuration for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnectionConfig {
    pub query: QueryConfig,
    pub validation: ValidationConfig,
    pub warehouse: WarehouseConfig,
}

impl ResolvedConnectionConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&ConnectionConfig>) -> Self {
        let query = override_cfg
            .and_then(|c| c.query.clone())
            .unwrap_or_else(|| defaults.query.clone());
        let warehouse = override_cfg
            .and_then(|c| c.warehouse.clone())
            .unwrap_or_else(|| defaults.warehouse.clone());
        Self {
            query,
            validation: defaults.validation.clone(),
            warehouse,
        }
    }
}
