//! In-memory execution history with optional persistence

use super::store::ExecutionStore;
use super::types::{ToolExecution, ToolStats};
use crate::error::MeshResult;
use crate::protocol::CallToolResult;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// What happens to a finished execution after it has been persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Drop from memory once storage accepted it
    EvictWhenPersisted,
    /// Keep in memory up to the ceiling
    KeepBounded,
}

/// Execution records and per-tool counters
///
/// Records are visible as `Running` while the call is in flight. Storage
/// writes happen after the in-memory update, outside any lock; a failed
/// write is logged and the record stays in memory.
pub struct ExecutionLog {
    executions: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    stats: RwLock<HashMap<String, ToolStats>>,
    storage: Option<Arc<dyn ExecutionStore>>,
    max_in_memory: usize,
    retention: Retention,
}

struct Entry {
    seq: u64,
    execution: ToolExecution,
}

impl ExecutionLog {
    pub fn new(
        max_in_memory: usize,
        storage: Option<Arc<dyn ExecutionStore>>,
        retention: Retention,
    ) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            stats: RwLock::new(HashMap::new()),
            storage,
            max_in_memory: max_in_memory.max(1),
            retention,
        }
    }

    /// Record a running execution and return its id
    pub fn begin(&self, tool_name: &str, arguments: Value) -> String {
        let execution = ToolExecution::start(tool_name, arguments);
        let id = execution.id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.executions
            .write()
            .insert(id.clone(), Entry { seq, execution });
        id
    }

    /// Finish an execution and update the tool's counters
    ///
    /// Only the first completion for an id has any effect.
    pub async fn complete(&self, id: &str, outcome: &MeshResult<CallToolResult>) {
        let finished = {
            let mut executions = self.executions.write();
            match executions.get_mut(id) {
                Some(entry) if entry.execution.is_running() => {
                    let success = entry.execution.finish(outcome);
                    Some((entry.execution.clone(), success))
                }
                Some(_) => None,
                None => {
                    warn!("Completion for unknown execution {}", id);
                    None
                }
            }
        };
        let Some((execution, success)) = finished else {
            return;
        };

        let stats = {
            let mut stats = self.stats.write();
            let entry = stats
                .entry(execution.tool_name.clone())
                .or_insert_with(|| ToolStats::new(execution.tool_name.clone()));
            entry.record(success, execution.end_time.unwrap_or_else(Utc::now));
            entry.clone()
        };

        debug!(
            "Execution {} of {} finished: {:?} in {}ms",
            execution.id,
            execution.tool_name,
            execution.status,
            execution.duration_ms.unwrap_or_default()
        );

        if let Some(storage) = &self.storage {
            match storage.save_tool_execution(&execution).await {
                Ok(()) => {
                    if self.retention == Retention::EvictWhenPersisted {
                        self.executions.write().remove(id);
                    }
                }
                Err(e) => warn!("Failed to persist execution {}: {}", id, e),
            }
            if let Err(e) = storage.update_tool_stats(&stats).await {
                warn!("Failed to persist stats for {}: {}", stats.tool_name, e);
            }
        }

        self.enforce_ceiling();
    }

    /// Drop the oldest finished records above the ceiling
    fn enforce_ceiling(&self) {
        let mut executions = self.executions.write();
        if executions.len() <= self.max_in_memory {
            return;
        }

        let mut finished: Vec<(u64, String)> = executions
            .values()
            .filter(|e| !e.execution.is_running())
            .map(|e| (e.seq, e.execution.id.clone()))
            .collect();
        finished.sort_unstable();

        let excess = executions.len() - self.max_in_memory;
        for (_, id) in finished.into_iter().take(excess) {
            executions.remove(&id);
        }
    }

    /// In-memory lookup
    pub fn get(&self, id: &str) -> Option<ToolExecution> {
        self.executions
            .read()
            .get(id)
            .map(|e| e.execution.clone())
    }

    /// Memory first, then storage
    pub async fn find(&self, id: &str) -> MeshResult<Option<ToolExecution>> {
        if let Some(execution) = self.get(id) {
            return Ok(Some(execution));
        }
        match &self.storage {
            Some(storage) => storage.get_tool_execution(id).await,
            None => Ok(None),
        }
    }

    /// Most recent executions first, merging memory and storage
    pub async fn recent(&self, limit: usize) -> MeshResult<Vec<ToolExecution>> {
        let mut merged: HashMap<String, ToolExecution> = match &self.storage {
            Some(storage) => storage
                .load_tool_executions(limit)
                .await?
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
            None => HashMap::new(),
        };
        for entry in self.executions.read().values() {
            merged.insert(entry.execution.id.clone(), entry.execution.clone());
        }

        let mut all: Vec<ToolExecution> = merged.into_values().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all.truncate(limit);
        Ok(all)
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> HashMap<String, ToolStats> {
        self.stats.read().clone()
    }

    /// Load stored counters so totals survive restarts
    pub async fn restore_stats(&self) -> MeshResult<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let loaded = storage.load_tool_stats().await?;
        let count = loaded.len();
        let mut stats = self.stats.write();
        for entry in loaded {
            stats.insert(entry.tool_name.clone(), entry);
        }
        Ok(count)
    }

    /// Records currently held in memory
    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }

    /// Calls still in flight
    pub fn running(&self) -> usize {
        self.executions
            .read()
            .values()
            .filter(|e| e.execution.is_running())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::execution::store::MockExecutionStore;
    use crate::execution::{ExecutionStatus, MemoryExecutionStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_begin_is_visible_as_running() {
        let log = ExecutionLog::new(10, None, Retention::KeepBounded);
        let id = log.begin("echo", json!({"text": "hi"}));

        let execution = log.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(log.running(), 1);
    }

    #[tokio::test]
    async fn test_complete_updates_stats_once() {
        let log = ExecutionLog::new(10, None, Retention::KeepBounded);
        let id = log.begin("echo", json!({}));

        log.complete(&id, &Ok(CallToolResult::text("hi"))).await;
        log.complete(&id, &Err(MeshError::other("late"))).await;

        let execution = log.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let stats = log.stats()["echo"].clone();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.success_calls, 1);
    }

    #[tokio::test]
    async fn test_ceiling_evicts_oldest_finished() {
        let log = ExecutionLog::new(2, None, Retention::KeepBounded);
        let running = log.begin("slow", json!({}));

        let mut finished = Vec::new();
        for _ in 0..3 {
            let id = log.begin("fast", json!({}));
            log.complete(&id, &Ok(CallToolResult::text("ok"))).await;
            finished.push(id);
        }

        assert_eq!(log.len(), 2);
        assert!(log.get(&running).is_some());
        assert!(log.get(&finished[2]).is_some());
        assert_eq!(log.stats()["fast"].total_calls, 3);
    }

    #[tokio::test]
    async fn test_evicts_after_persisting() {
        let store = Arc::new(MemoryExecutionStore::new());
        let log = ExecutionLog::new(
            10,
            Some(store.clone() as Arc<dyn ExecutionStore>),
            Retention::EvictWhenPersisted,
        );

        let id = log.begin("echo", json!({}));
        log.complete(&id, &Ok(CallToolResult::text("hi"))).await;

        assert!(log.get(&id).is_none());
        assert_eq!(store.len(), 1);
        let found = log.find(&id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_record() {
        let mut store = MockExecutionStore::new();
        store
            .expect_save_tool_execution()
            .times(1)
            .returning(|_| Err(MeshError::storage("disk full")));
        store
            .expect_update_tool_stats()
            .times(1)
            .returning(|_| Ok(()));

        let log = ExecutionLog::new(10, Some(Arc::new(store)), Retention::EvictWhenPersisted);
        let id = log.begin("echo", json!({}));
        log.complete(&id, &Ok(CallToolResult::text("hi"))).await;

        assert!(log.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_restore_stats() {
        let mut store = MockExecutionStore::new();
        store.expect_load_tool_stats().returning(|| {
            let mut stats = ToolStats::new("scan");
            stats.total_calls = 7;
            stats.success_calls = 5;
            stats.failed_calls = 2;
            Ok(vec![stats])
        });

        let log = ExecutionLog::new(10, Some(Arc::new(store)), Retention::KeepBounded);
        assert_eq!(log.restore_stats().await.unwrap(), 1);
        assert_eq!(log.stats()["scan"].total_calls, 7);
    }

    #[tokio::test]
    async fn test_recent_merges_memory_and_storage() {
        let store = Arc::new(MemoryExecutionStore::new());
        let old = ToolExecution::start("archived", json!({}));
        store.save_tool_execution(&old).await.unwrap();

        let log = ExecutionLog::new(
            10,
            Some(store as Arc<dyn ExecutionStore>),
            Retention::KeepBounded,
        );
        let id = log.begin("live", json!({}));

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, id);
    }
}
