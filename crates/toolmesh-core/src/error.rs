//! Error types for toolmesh
//!
//! Every fallible operation in the crate returns [`MeshResult`]. Protocol-level
//! failures that must travel back to a peer are expressed separately as
//! [`RpcError`](crate::protocol::RpcError) inside an envelope.

use crate::protocol::RpcError;
use thiserror::Error;

/// Result type alias for toolmesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors raised by the dispatcher, the transport clients and the provider manager
#[derive(Debug, Error, Clone)]
pub enum MeshError {
    /// Could not reach or spawn a provider
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Peer sent something that is not a valid envelope for the exchange
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Underlying I/O failed while the link was up
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The link went away while a request was pending
    #[error("Transport closed: {message}")]
    TransportClosed { message: String },

    /// Peer answered with an error envelope
    #[error("Remote error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// No tool registered under the name
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// Arguments or params could not be decoded
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// A qualified name did not split into provider and tool
    #[error("Invalid tool name '{name}': expected <provider>::<tool>")]
    InvalidToolName { name: String },

    /// No provider configured under the name
    #[error("Provider not configured: {name}")]
    ProviderNotConfigured { name: String },

    /// Provider exists but has no usable connection
    #[error("Provider '{name}' unavailable: {reason}")]
    ProviderUnavailable { name: String, reason: String },

    /// Waiting for a response exceeded the deadline
    #[error("Request timeout after {millis} ms")]
    Timeout { millis: u64 },

    /// Caller gave up
    #[error("Operation cancelled")]
    Cancelled,

    /// Client was already initialized or is mid-handshake
    #[error("Client already initialized")]
    AlreadyInitialized,

    /// Serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Durable storage failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Anything else
    #[error("{message}")]
    Other { message: String },
}

impl MeshError {
    /// Create a new Connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new TransportClosed error
    pub fn transport_closed(message: impl Into<String>) -> Self {
        Self::TransportClosed {
            message: message.into(),
        }
    }

    /// Create a new Rpc error
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a new ToolNotFound error
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    /// Create a new InvalidParams error
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Create a new InvalidToolName error
    pub fn invalid_tool_name(name: impl Into<String>) -> Self {
        Self::InvalidToolName { name: name.into() }
    }

    /// Create a new ProviderNotConfigured error
    pub fn provider_not_configured(name: impl Into<String>) -> Self {
        Self::ProviderNotConfigured { name: name.into() }
    }

    /// Create a new ProviderUnavailable error
    pub fn provider_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            millis: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new Storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new Other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Stable code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "MESH_CONNECTION",
            Self::Protocol { .. } => "MESH_PROTOCOL",
            Self::Transport { .. } => "MESH_TRANSPORT",
            Self::TransportClosed { .. } => "MESH_TRANSPORT_CLOSED",
            Self::Rpc { .. } => "MESH_RPC",
            Self::ToolNotFound { .. } => "MESH_TOOL_NOT_FOUND",
            Self::InvalidParams { .. } => "MESH_INVALID_PARAMS",
            Self::InvalidToolName { .. } => "MESH_INVALID_TOOL_NAME",
            Self::ProviderNotConfigured { .. } => "MESH_PROVIDER_NOT_CONFIGURED",
            Self::ProviderUnavailable { .. } => "MESH_PROVIDER_UNAVAILABLE",
            Self::Timeout { .. } => "MESH_TIMEOUT",
            Self::Cancelled => "MESH_CANCELLED",
            Self::AlreadyInitialized => "MESH_ALREADY_INITIALIZED",
            Self::Serialization { .. } => "MESH_SERIALIZATION",
            Self::Config { .. } => "MESH_CONFIG",
            Self::Storage { .. } => "MESH_STORAGE",
            Self::Other { .. } => "MESH_OTHER",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Transport { .. }
                | Self::TransportClosed { .. }
                | Self::Timeout { .. }
                | Self::ProviderUnavailable { .. }
        )
    }

    /// Whether the error reflects a broken link rather than a remote answer
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Transport { .. } | Self::TransportClosed { .. }
        )
    }
}

impl From<RpcError> for MeshError {
    fn from(err: RpcError) -> Self {
        Self::rpc(err.code, err.message)
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::connection(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout { millis: 0 }
        } else {
            Self::transport(err.to_string())
        }
    }
}

impl From<toml::de::Error> for MeshError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}
