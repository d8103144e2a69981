//! Manager-facing views and qualified tool names

use crate::config::TransportKind;
use crate::error::{MeshError, MeshResult};
use crate::execution::ToolStats;
use crate::protocol::ToolDefinition;
use crate::transport::ClientStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Separator between provider and tool in a qualified name
pub const QUALIFIER: &str = "::";

/// Snapshot of one configured provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub status: ClientStatus,
    /// Tools in the last good catalog
    pub tool_count: usize,
    /// When that catalog was fetched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_refreshed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub endpoint: String,
}

/// Everything [`super::ProviderManager::get_stats`] reports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    /// Providers sorted by name
    pub providers: Vec<ProviderSummary>,
    pub total_tools: usize,
    pub connected: usize,
    /// Calls still in flight
    pub running_executions: usize,
    pub tool_stats: HashMap<String, ToolStats>,
}

/// `<provider>::<tool>`
pub fn qualify(provider: &str, tool: &str) -> String {
    format!("{}{}{}", provider, QUALIFIER, tool)
}

/// Split on the first separator; both halves must be non-empty
pub fn split_qualified(name: &str) -> MeshResult<(&str, &str)> {
    match name.split_once(QUALIFIER) {
        Some((provider, tool)) if !provider.is_empty() && !tool.is_empty() => Ok((provider, tool)),
        _ => Err(MeshError::invalid_tool_name(name)),
    }
}

/// Copy of a remote definition renamed into the shared namespace
pub(crate) fn qualified_definition(provider: &str, tool: &ToolDefinition) -> ToolDefinition {
    let mut definition = tool.clone();
    definition.name = qualify(provider, &tool.name);
    definition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_first_separator() {
        assert_eq!(split_qualified("scanner::nmap").unwrap(), ("scanner", "nmap"));
        assert_eq!(
            split_qualified("scanner::ns::lookup").unwrap(),
            ("scanner", "ns::lookup")
        );
    }

    #[test]
    fn test_split_rejects_unqualified() {
        for name in ["nmap", "::nmap", "scanner::", ""] {
            let err = split_qualified(name).unwrap_err();
            assert!(matches!(err, MeshError::InvalidToolName { .. }), "{}", name);
        }
    }

    #[test]
    fn test_qualified_definition_keeps_schema() {
        let tool = ToolDefinition::new("nmap", "Port scanner")
            .with_input_schema(serde_json::json!({"type": "object"}));
        let qualified = qualified_definition("scanner", &tool);
        assert_eq!(qualified.name, "scanner::nmap");
        assert_eq!(qualified.input_schema, tool.input_schema);
    }
}
