//! Tool execution history and statistics

mod log;
mod store;
mod types;

pub use log::{ExecutionLog, Retention};
pub use store::{ExecutionStore, MemoryExecutionStore};
pub use types::{ExecutionStatus, ToolExecution, ToolStats};

#[cfg(test)]
pub use store::MockExecutionStore;
