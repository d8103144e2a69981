//! Handler traits plugged into the dispatcher

use crate::error::MeshResult;
use crate::protocol::CallToolResult;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Executes one registered tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with decoded arguments
    ///
    /// Returning `Err` or a result with `is_error` both count as a failed call.
    async fn call(&self, arguments: Value) -> MeshResult<CallToolResult>;
}

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = MeshResult<CallToolResult>> + Send,
{
    async fn call(&self, arguments: Value) -> MeshResult<CallToolResult> {
        (self.f)(arguments).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MeshResult<CallToolResult>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Answers `sampling/request` on behalf of the dispatcher
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    /// Produce a completion for the request params
    async fn create_message(&self, params: Value) -> MeshResult<Value>;
}
