//! Wire protocol shared by every transport
//!
//! - [`Envelope`]: the single message shape for requests, notifications,
//!   responses and errors
//! - payload types for tools, prompts, resources and the handshake
//! - an incremental `text/event-stream` parser used by the streaming client

pub mod envelope;
pub mod sse;
pub mod types;

pub use envelope::{
    Envelope, INITIALIZED_NOTIFICATION, JSONRPC_VERSION, Method, PROTOCOL_VERSION, RequestId,
    RpcError,
};
pub use sse::{SseEvent, SseParser};
pub use types::{
    CallToolParams, CallToolResult, Content, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListParams, ListToolsResult, Prompt, PromptArgument,
    PromptMessage, PromptRole, ReadResourceParams, Resource, ResourceContent, ToolDefinition,
};
