//! Durable storage port for execution history
//!
//! The dispatcher and the provider manager work without storage; when one is
//! configured, finished executions and updated stats are handed to it.

use super::types::{ToolExecution, ToolStats};
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Persistence collaborator for executions and stats
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace an execution
    async fn save_tool_execution(&self, execution: &ToolExecution) -> MeshResult<()>;

    /// Most recent executions first
    async fn load_tool_executions(&self, limit: usize) -> MeshResult<Vec<ToolExecution>>;

    /// Look up one execution
    async fn get_tool_execution(&self, id: &str) -> MeshResult<Option<ToolExecution>>;

    /// Store the latest counters for a tool
    async fn update_tool_stats(&self, stats: &ToolStats) -> MeshResult<()>;

    /// All stored counters
    async fn load_tool_stats(&self) -> MeshResult<Vec<ToolStats>>;
}

/// Process-local store, useful for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<String, ToolExecution>>,
    stats: RwLock<HashMap<String, ToolStats>>,
}

impl MemoryExecutionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions
    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save_tool_execution(&self, execution: &ToolExecution) -> MeshResult<()> {
        if execution.id.is_empty() {
            return Err(MeshError::storage("execution id is empty"));
        }
        self.executions
            .write()
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_tool_executions(&self, limit: usize) -> MeshResult<Vec<ToolExecution>> {
        let mut all: Vec<ToolExecution> = self.executions.read().values().cloned().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all.truncate(limit);
        Ok(all)
    }

    async fn get_tool_execution(&self, id: &str) -> MeshResult<Option<ToolExecution>> {
        Ok(self.executions.read().get(id).cloned())
    }

    async fn update_tool_stats(&self, stats: &ToolStats) -> MeshResult<()> {
        self.stats
            .write()
            .insert(stats.tool_name.clone(), stats.clone());
        Ok(())
    }

    async fn load_tool_stats(&self) -> MeshResult<Vec<ToolStats>> {
        Ok(self.stats.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryExecutionStore::new();
        let exec = ToolExecution::start("echo", json!({}));

        store.save_tool_execution(&exec).await.unwrap();
        let loaded = store.get_tool_execution(&exec.id).await.unwrap();

        assert_eq!(loaded, Some(exec));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_load_orders_newest_first_and_limits() {
        let store = MemoryExecutionStore::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut exec = ToolExecution::start(format!("t{}", i), json!({}));
            exec.start_time += chrono::Duration::seconds(i);
            ids.push(exec.id.clone());
            store.save_tool_execution(&exec).await.unwrap();
        }

        let loaded = store.load_tool_executions(2).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, ids[2]);
        assert_eq!(loaded[1].id, ids[1]);
    }
}
