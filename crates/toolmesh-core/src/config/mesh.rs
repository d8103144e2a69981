//! Top-level configuration file

use super::logging::LoggingConfig;
use super::provider::ProviderConfig;
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

fn default_server_name() -> String {
    "toolmesh".to_string()
}

fn default_handler_timeout() -> u64 {
    600 // 10 minutes
}

fn default_history() -> usize {
    1000
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_fast_fail() -> u64 {
    3000
}

fn default_settle_delay() -> u64 {
    2000
}

/// Dispatcher (server role) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Name announced in the `initialize` result
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Ceiling on a single handler run, in seconds
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    /// Finished executions kept in memory when no storage is configured
    #[serde(default = "default_history")]
    pub max_history: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            handler_timeout_secs: default_handler_timeout(),
            max_history: default_history(),
        }
    }
}

impl ServerSettings {
    /// Handler ceiling as a duration
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// Provider manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Background catalog refresh period, in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Per-provider budget inside an aggregate listing, in milliseconds
    #[serde(default = "default_fast_fail")]
    pub fast_fail_timeout_ms: u64,
    /// Delay before the follow-up refresh after a connect, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// In-memory execution ceiling
    #[serde(default = "default_history")]
    pub max_executions: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            fast_fail_timeout_ms: default_fast_fail(),
            settle_delay_ms: default_settle_delay(),
            max_executions: default_history(),
        }
    }
}

impl ManagerSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fast_fail_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_fail_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Providers by name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl MeshConfig {
    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MeshError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> MeshResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> MeshResult<()> {
        if self.server.handler_timeout_secs == 0 {
            return Err(MeshError::config("server.handler_timeout_secs must be positive"));
        }
        if self.manager.refresh_interval_secs == 0 {
            return Err(MeshError::config("manager.refresh_interval_secs must be positive"));
        }
        for (name, provider) in &self.providers {
            provider.validate(name)?;
        }
        Ok(())
    }

    /// Providers with `enabled = true`
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, config)| config.enabled)
    }
}
