//! Command implementations

pub mod call;
pub mod providers;
pub mod serve;
pub mod tools;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use toolmesh_core::{MeshConfig, ProviderManager};
use tracing::{debug, warn};

/// How long one-shot commands wait for providers to finish connecting
const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Read the configuration file; a missing file means an empty mesh
pub fn load_config(path: &Path) -> Result<MeshConfig> {
    if !path.exists() {
        debug!("No configuration at {}, using defaults", path.display());
        return Ok(MeshConfig::default());
    }
    MeshConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Manager with every enabled provider connected or settled
pub async fn connect_manager(config: &MeshConfig) -> Result<Arc<ProviderManager>> {
    let manager = ProviderManager::new(config.manager.clone());
    manager.load_config(config).await?;
    if !manager.wait_for_connections(CONNECT_WAIT).await {
        warn!("Some providers are still connecting after {:?}", CONNECT_WAIT);
    }
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_config_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[providers.scanner]\ntransport = \"stdio\"").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("scanner"));
    }
}
