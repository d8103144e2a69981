//! Client-side transports
//!
//! Three clients share one call contract, [`TransportClient`]:
//!
//! - **HTTP**: one POST per request
//! - **Stdio**: line-delimited envelopes over a child process's pipes
//! - **SSE**: a long-lived event stream for responses plus a POST endpoint
//!   for requests

mod factory;
mod http;
mod pending;
mod session;
mod sse;
mod status;
mod stdio;

pub use factory::{ClientFactory, TransportFactory};
pub use http::HttpClient;
pub use sse::{SseClient, derive_post_url};
pub use status::ClientStatus;
pub use stdio::StdioClient;

use crate::config::TransportKind;
use crate::error::MeshResult;
use crate::protocol::{CallToolResult, Implementation, ToolDefinition};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Call contract shared by every transport
///
/// Requests race the caller's cancellation token and the configured
/// per-request timeout. Cancelling returns early but does not recall a
/// request already on the wire.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open the link and run the handshake
    async fn initialize(&self, cancel: &CancellationToken) -> MeshResult<Implementation>;

    /// Full tool catalog, following pagination
    async fn list_tools(&self, cancel: &CancellationToken) -> MeshResult<Vec<ToolDefinition>>;

    /// Invoke one tool
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Value,
    ) -> MeshResult<CallToolResult>;

    /// Tear the link down; safe to call more than once
    async fn close(&self) -> MeshResult<()>;

    /// Current connection state
    fn status(&self) -> ClientStatus;

    /// Cause of the last failure, if any
    fn last_error(&self) -> Option<String>;

    /// Transport this client speaks
    fn transport(&self) -> TransportKind;

    fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }
}
