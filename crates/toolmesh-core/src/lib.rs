//! Toolmesh Core Library
//!
//! Uniform tool-call plumbing: a JSON-RPC style envelope, a dispatcher that
//! serves registered tools, prompts and resources, client transports for
//! HTTP, stdio subprocess and event-stream providers, and a manager that
//! supervises those providers behind one namespaced tool catalog.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod manager;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use config::{ManagerSettings, MeshConfig, ProviderConfig, ServerSettings, TransportKind};
pub use dispatcher::{Dispatcher, ToolCallOutcome, ToolHandler, bridge_remote_tools, handler_fn};
pub use error::{MeshError, MeshResult};
pub use execution::{ExecutionStore, MemoryExecutionStore, ToolExecution, ToolStats};
pub use manager::{ManagerStats, ProviderManager, ProviderSummary};
pub use protocol::{CallToolResult, Envelope, RequestId, RpcError, ToolDefinition};
pub use transport::{ClientFactory, ClientStatus, TransportClient, TransportFactory};
