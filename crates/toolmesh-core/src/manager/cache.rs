//! Last good tool catalog per provider

use crate::protocol::ToolDefinition;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// One provider's catalog as last seen
#[derive(Debug, Clone)]
pub struct CachedCatalog {
    pub tools: Vec<ToolDefinition>,
    pub refreshed_at: DateTime<Utc>,
}

/// Catalog cache keyed by provider name
///
/// Entries never expire on their own; they are replaced by a successful
/// listing or dropped when the provider's config changes.
#[derive(Default)]
pub(crate) struct ToolCache {
    entries: RwLock<HashMap<String, CachedCatalog>>,
}

impl ToolCache {
    /// Replace a provider's catalog; returns the new tool count
    pub fn store(&self, provider: &str, tools: Vec<ToolDefinition>) -> usize {
        let count = tools.len();
        self.entries.write().insert(
            provider.to_string(),
            CachedCatalog {
                tools,
                refreshed_at: Utc::now(),
            },
        );
        debug!("Cached {} tools for provider {}", count, provider);
        count
    }

    pub fn get(&self, provider: &str) -> Option<CachedCatalog> {
        self.entries.read().get(provider).cloned()
    }

    pub fn count(&self, provider: &str) -> Option<usize> {
        self.entries.read().get(provider).map(|c| c.tools.len())
    }

    pub fn invalidate(&self, provider: &str) {
        if self.entries.write().remove(provider).is_some() {
            debug!("Invalidated tool cache for provider {}", provider);
        }
    }
}
