//! Exposes provider tools through the dispatcher

use super::{Dispatcher, ToolHandler};
use crate::error::MeshResult;
use crate::manager::{ProviderManager, QUALIFIER};
use crate::protocol::CallToolResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Forwards a call to the provider owning the qualified name
struct RemoteTool {
    manager: Arc<ProviderManager>,
    qualified_name: String,
    cancel: CancellationToken,
}

#[async_trait]
impl ToolHandler for RemoteTool {
    async fn call(&self, arguments: Value) -> MeshResult<CallToolResult> {
        self.manager
            .call_tool(&self.cancel, &self.qualified_name, arguments)
            .await
    }
}

/// Register every provider tool under its `<provider>::<tool>` name
///
/// Bridged tools that vanished from the merged catalog are unregistered;
/// local tools are never touched. Calls through the bridge are cancelled
/// with `cancel`. Returns the number of bridged tools.
pub async fn bridge_remote_tools(
    manager: &Arc<ProviderManager>,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
) -> MeshResult<usize> {
    let tools = manager.get_all_tools(cancel).await;
    let current: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    for stale in dispatcher
        .list_tools()
        .into_iter()
        .filter(|t| t.name.contains(QUALIFIER) && !current.contains(t.name.as_str()))
    {
        debug!("Unbridging {}", stale.name);
        dispatcher.unregister_tool(&stale.name);
    }

    let count = tools.len();
    for definition in tools {
        let handler = Arc::new(RemoteTool {
            manager: Arc::clone(manager),
            qualified_name: definition.name.clone(),
            cancel: cancel.child_token(),
        });
        dispatcher.register_tool(definition, handler);
    }
    info!("Bridged {} provider tools", count);
    Ok(count)
}
