//! Provider (external tool server) configuration

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Default per-request timeout for a provider
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

fn default_true() -> bool {
    true
}

/// How a provider is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited envelopes on stdio
    Stdio,
    /// One POST per request
    Http,
    /// Event stream for responses plus a derived POST endpoint for requests
    #[serde(alias = "streaming")]
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        })
    }
}

/// Configuration for a single provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Transport type
    pub transport: TransportKind,
    /// Command to execute (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments (stdio)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables (stdio)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL (http, sse)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra HTTP headers (http, sse)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Whether this provider should be connected
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Request timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Free-form description shown in listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProviderConfig {
    fn base(transport: TransportKind) -> Self {
        Self {
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            enabled: true,
            timeout_secs: None,
            description: None,
        }
    }

    /// Create a stdio provider config
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::base(TransportKind::Stdio)
        }
    }

    /// Create an HTTP provider config
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::base(TransportKind::Http)
        }
    }

    /// Create a streaming provider config
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::base(TransportKind::Sse)
        }
    }

    /// Add environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add HTTP header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Effective per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Command line or URL, whichever the transport uses
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::Stdio => {
                let mut parts = vec![self.command.clone().unwrap_or_default()];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
            TransportKind::Http | TransportKind::Sse => self.url.clone().unwrap_or_default(),
        }
    }

    /// Check that the fields required by the transport are present
    pub fn validate(&self, name: &str) -> MeshResult<()> {
        if name.is_empty() || name.contains("::") {
            return Err(MeshError::config(format!(
                "invalid provider name '{}': must be non-empty and must not contain '::'",
                name
            )));
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return Err(MeshError::config(format!(
                        "provider '{}': stdio transport requires command",
                        name
                    )));
                }
            }
            TransportKind::Http | TransportKind::Sse => {
                let url = self.url.as_deref().unwrap_or_default();
                if reqwest::Url::parse(url).is_err() {
                    return Err(MeshError::config(format!(
                        "provider '{}': {} transport requires a valid url, got '{}'",
                        name, self.transport, url
                    )));
                }
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(MeshError::config(format!(
                "provider '{}': timeout_secs must be positive",
                name
            )));
        }
        Ok(())
    }
}
