//! Client construction by declared transport

use super::{HttpClient, SseClient, StdioClient, TransportClient};
use crate::config::{ProviderConfig, TransportKind};
use crate::error::MeshResult;
use std::sync::Arc;

/// Builds a fresh, unconnected client for a provider
pub trait ClientFactory: Send + Sync {
    fn create(&self, name: &str, config: &ProviderConfig) -> MeshResult<Arc<dyn TransportClient>>;
}

/// Picks the client implementation from [`ProviderConfig::transport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportFactory;

impl ClientFactory for TransportFactory {
    fn create(&self, name: &str, config: &ProviderConfig) -> MeshResult<Arc<dyn TransportClient>> {
        config.validate(name)?;
        let client: Arc<dyn TransportClient> = match config.transport {
            TransportKind::Stdio => Arc::new(StdioClient::new(name, config)?),
            TransportKind::Http => Arc::new(HttpClient::new(name, config)?),
            TransportKind::Sse => Arc::new(SseClient::new(name, config)?),
        };
        Ok(client)
    }
}
