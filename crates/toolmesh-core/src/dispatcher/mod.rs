//! Server-role message dispatcher
//!
//! The dispatcher owns the tool, prompt and resource registries, routes
//! inbound envelopes to them, and keeps execution history and per-tool
//! statistics for every `tools/call`.

mod gateway;
mod handler;
mod registry;
mod routing;
mod serve;


pub use gateway::bridge_remote_tools;
pub use handler::{FnHandler, SamplingHandler, ToolHandler, handler_fn};
pub use registry::TOOL_RESOURCE_SCHEME;
pub use serve::serve_stdio;

use crate::config::ServerSettings;
use crate::error::{MeshError, MeshResult};
use crate::execution::{ExecutionLog, ExecutionStore, Retention, ToolExecution, ToolStats};
use crate::protocol::{CallToolResult, Implementation, Prompt, Resource, ToolDefinition};
use parking_lot::RwLock;
use registry::Registry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a direct tool call
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    /// Id of the recorded execution
    pub execution_id: String,
    /// Tool result; error-flagged when the call failed
    pub result: CallToolResult,
}

/// Registry plus router for the server role
pub struct Dispatcher {
    info: Implementation,
    registry: Registry,
    executions: Arc<ExecutionLog>,
    sampling: RwLock<Option<Arc<dyn SamplingHandler>>>,
    handler_timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher keeping history in memory only
    pub fn new(settings: &ServerSettings) -> Self {
        Self::build(settings, None)
    }

    /// Dispatcher handing finished executions to `storage`
    pub fn with_storage(settings: &ServerSettings, storage: Arc<dyn ExecutionStore>) -> Self {
        Self::build(settings, Some(storage))
    }

    fn build(settings: &ServerSettings, storage: Option<Arc<dyn ExecutionStore>>) -> Self {
        Self {
            info: Implementation {
                name: settings.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            registry: Registry::default(),
            executions: Arc::new(ExecutionLog::new(
                settings.max_history,
                storage,
                Retention::EvictWhenPersisted,
            )),
            sampling: RwLock::new(None),
            handler_timeout: settings.handler_timeout(),
        }
    }

    /// Identity announced during `initialize`
    pub fn server_info(&self) -> &Implementation {
        &self.info
    }

    /// Install the collaborator answering `sampling/request`
    pub fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        *self.sampling.write() = Some(handler);
    }

    /// Register or overwrite a tool and its documentation resource
    pub fn register_tool(&self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        let name = definition.name.clone();
        if self.registry.insert_tool(definition, handler) {
            debug!("Replaced tool {}", name);
        } else {
            debug!("Registered tool {}", name);
        }
    }

    /// Remove a tool; returns whether it existed
    pub fn unregister_tool(&self, name: &str) -> bool {
        self.registry.remove_tool(name)
    }

    /// Remove every tool
    pub fn clear_tools(&self) {
        let removed = self.registry.clear_tools();
        info!("Cleared {} tools", removed);
    }

    /// Registered tool definitions, sorted by name
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.tool(name).is_some()
    }

    pub fn register_prompt(&self, prompt: Prompt) {
        self.registry.insert_prompt(prompt);
    }

    /// Register a resource served with the given text
    pub fn register_resource(&self, resource: Resource, content: impl Into<String>) {
        self.registry.insert_resource(resource, content.into());
    }

    /// Run a tool directly, bypassing envelope decoding
    ///
    /// An unknown name is recorded as a failed call and returned as
    /// [`MeshError::ToolNotFound`]. Any other failure comes back as an
    /// error-flagged result. The handler runs on a supervising task that
    /// also records the outcome, so the execution is finished even when the
    /// caller stops waiting. Cancelling `cancel` aborts the handler and
    /// records the call as failed.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Value,
    ) -> MeshResult<ToolCallOutcome> {
        let execution_id = self.executions.begin(name, arguments.clone());

        let Some(tool) = self.registry.tool(name) else {
            let err = MeshError::tool_not_found(name);
            self.executions.complete(&execution_id, &Err(err.clone())).await;
            warn!("Call to unknown tool {}", name);
            return Err(err);
        };

        let supervisor = {
            let executions = Arc::clone(&self.executions);
            let execution_id = execution_id.clone();
            let cancel = cancel.clone();
            let ceiling = self.handler_timeout;
            tokio::spawn(async move {
                let outcome = run_handler(tool.handler, arguments, ceiling, &cancel).await;
                executions.complete(&execution_id, &outcome).await;
                outcome
            })
        };

        let outcome = match supervisor.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let err = MeshError::other(format!("Tool call task failed: {}", join_err));
                self.executions.complete(&execution_id, &Err(err.clone())).await;
                Err(err)
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => CallToolResult::error(e.to_string()),
        };
        Ok(ToolCallOutcome {
            execution_id,
            result,
        })
    }

    /// Most recent executions first
    pub async fn executions(&self, limit: usize) -> MeshResult<Vec<ToolExecution>> {
        self.executions.recent(limit).await
    }

    /// One execution, from memory or storage
    pub async fn execution(&self, id: &str) -> MeshResult<Option<ToolExecution>> {
        self.executions.find(id).await
    }

    /// Counters for every tool that has been called
    pub fn tool_stats(&self) -> HashMap<String, ToolStats> {
        self.executions.stats()
    }

    /// Load stored counters into memory
    pub async fn restore_stats(&self) -> MeshResult<usize> {
        self.executions.restore_stats().await
    }
}

/// Handler on its own task, bounded by the ceiling and `cancel`
async fn run_handler(
    handler: Arc<dyn ToolHandler>,
    arguments: Value,
    ceiling: Duration,
    cancel: &CancellationToken,
) -> MeshResult<CallToolResult> {
    let mut task = tokio::spawn(async move { handler.call(arguments).await });

    tokio::select! {
        joined = tokio::time::timeout(ceiling, &mut task) => match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(MeshError::other("Tool handler panicked"))
            }
            Ok(Err(join_err)) => Err(MeshError::other(format!(
                "Tool handler aborted: {}",
                join_err
            ))),
            Err(_) => {
                task.abort();
                Err(MeshError::timeout(ceiling))
            }
        },
        _ = cancel.cancelled() => {
            task.abort();
            debug!("Tool call cancelled");
            Err(MeshError::Cancelled)
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(&ServerSettings::default())
    }
}
