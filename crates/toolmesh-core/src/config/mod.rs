//! Configuration: providers, dispatcher and manager settings, logging

mod logging;
mod mesh;
mod provider;

pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use mesh::{ManagerSettings, MeshConfig, ServerSettings};
pub use provider::{DEFAULT_REQUEST_TIMEOUT_SECS, ProviderConfig, TransportKind};
