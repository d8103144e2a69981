//! Execution records and per-tool statistics

use crate::error::MeshResult;
use crate::protocol::CallToolResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of one tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One tool call, created at start and finished exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    /// Execution id
    pub id: String,
    /// Tool name (qualified for remote tools)
    pub tool_name: String,
    /// Call arguments
    pub arguments: Value,
    /// Current status
    pub status: ExecutionStatus,
    /// When the call started
    pub start_time: DateTime<Utc>,
    /// When the call finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Tool result, also kept for error-flagged results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CallToolResult>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecution {
    /// Start a new running execution
    pub fn start(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    /// Whether the call is still in flight
    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    /// Record the outcome; returns whether the call counts as a success
    pub(crate) fn finish(&mut self, outcome: &MeshResult<CallToolResult>) -> bool {
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_ms = Some(
            u64::try_from((end - self.start_time).num_milliseconds()).unwrap_or_default(),
        );

        let success = match outcome {
            Ok(result) if !result.is_error => true,
            Ok(result) => {
                self.error = Some(result.text_content());
                false
            }
            Err(e) => {
                self.error = Some(e.to_string());
                false
            }
        };
        if let Ok(result) = outcome {
            self.result = Some(result.clone());
        }
        self.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        success
    }
}

/// Monotonic counters for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStats {
    /// Tool name
    pub tool_name: String,
    /// Total number of calls
    pub total_calls: u64,
    /// Successful calls
    pub success_calls: u64,
    /// Failed calls
    pub failed_calls: u64,
    /// Time of the last finished call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_call_time: Option<DateTime<Utc>>,
}

impl ToolStats {
    /// Empty counters
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            total_calls: 0,
            success_calls: 0,
            failed_calls: 0,
            last_call_time: None,
        }
    }

    pub(crate) fn record(&mut self, success: bool, at: DateTime<Utc>) {
        self.total_calls += 1;
        if success {
            self.success_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.last_call_time = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use serde_json::json;

    #[test]
    fn test_finish_success() {
        let mut exec = ToolExecution::start("echo", json!({"x": "hi"}));
        assert!(exec.is_running());

        let success = exec.finish(&Ok(CallToolResult::text("hi")));
        assert!(success);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.end_time.is_some());
        assert!(exec.error.is_none());
    }

    #[test]
    fn test_finish_error_flagged_result_is_failure() {
        let mut exec = ToolExecution::start("scan", json!({}));
        let success = exec.finish(&Ok(CallToolResult::error("exit status 2")));

        assert!(!success);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("exit status 2"));
        assert!(exec.result.as_ref().is_some_and(|r| r.is_error));
    }

    #[test]
    fn test_finish_mechanism_failure() {
        let mut exec = ToolExecution::start("scan", json!({}));
        exec.finish(&Err(MeshError::transport_closed("child exited")));

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.result.is_none());
        assert!(exec.error.unwrap().contains("child exited"));
    }

    #[test]
    fn test_stats_record() {
        let mut stats = ToolStats::new("echo");
        stats.record(true, Utc::now());
        stats.record(false, Utc::now());
        stats.record(true, Utc::now());

        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.success_calls, 2);
        assert_eq!(stats.failed_calls, 1);
        assert!(stats.last_call_time.is_some());
    }
}
