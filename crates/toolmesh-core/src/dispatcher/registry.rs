//! Name-keyed tables of tools, prompts and resources

use super::handler::ToolHandler;
use crate::protocol::{Prompt, Resource, ResourceContent, ToolDefinition};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// URI scheme of the documentation resource derived from each tool
pub const TOOL_RESOURCE_SCHEME: &str = "tool://";

#[derive(Clone)]
pub(crate) struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

#[derive(Clone)]
struct StoredResource {
    resource: Resource,
    text: String,
}

/// In-process registry
///
/// Each tool owns exactly one `tool://<name>` resource; registering and
/// removing a tool keeps the pair in step under one write lock.
#[derive(Default)]
pub(crate) struct Registry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    tool_docs: RwLock<HashMap<String, StoredResource>>,
    prompts: RwLock<HashMap<String, Prompt>>,
    resources: RwLock<HashMap<String, StoredResource>>,
}

impl Registry {
    pub fn insert_tool(&self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> bool {
        let doc = tool_document(&definition);
        let name = definition.name.clone();

        let mut tools = self.tools.write();
        let replaced = tools
            .insert(name.clone(), RegisteredTool { definition, handler })
            .is_some();
        self.tool_docs.write().insert(name, doc);
        replaced
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let mut tools = self.tools.write();
        let removed = tools.remove(name).is_some();
        self.tool_docs.write().remove(name);
        removed
    }

    pub fn clear_tools(&self) -> usize {
        let mut tools = self.tools.write();
        let count = tools.len();
        tools.clear();
        self.tool_docs.write().clear();
        count
    }

    pub fn tool(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.read().get(name).cloned()
    }

    /// Definitions sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| t.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn insert_prompt(&self, prompt: Prompt) {
        self.prompts.write().insert(prompt.name.clone(), prompt);
    }

    pub fn prompt(&self, name: &str) -> Option<Prompt> {
        self.prompts.read().get(name).cloned()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        let mut prompts: Vec<Prompt> = self.prompts.read().values().cloned().collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    pub fn insert_resource(&self, resource: Resource, text: String) {
        self.resources
            .write()
            .insert(resource.uri.clone(), StoredResource { resource, text });
    }

    /// Registered resources followed by tool documentation, each sorted by URI
    pub fn resources(&self) -> Vec<Resource> {
        let mut own: Vec<Resource> = self
            .resources
            .read()
            .values()
            .map(|r| r.resource.clone())
            .collect();
        own.sort_by(|a, b| a.uri.cmp(&b.uri));

        let mut docs: Vec<Resource> = self
            .tool_docs
            .read()
            .values()
            .map(|r| r.resource.clone())
            .collect();
        docs.sort_by(|a, b| a.uri.cmp(&b.uri));

        own.extend(docs);
        own
    }

    pub fn read_resource(&self, uri: &str) -> Option<ResourceContent> {
        let stored = match uri.strip_prefix(TOOL_RESOURCE_SCHEME) {
            Some(name) => self.tool_docs.read().get(name).cloned(),
            None => self.resources.read().get(uri).cloned(),
        }?;
        Some(ResourceContent {
            uri: stored.resource.uri,
            mime_type: stored.resource.mime_type,
            text: Some(stored.text),
        })
    }
}

fn tool_document(definition: &ToolDefinition) -> StoredResource {
    let uri = format!("{}{}", TOOL_RESOURCE_SCHEME, definition.name);
    let schema = serde_json::to_string_pretty(&definition.input_schema)
        .unwrap_or_else(|_| definition.input_schema.to_string());

    let mut text = format!("# {}\n\n{}\n", definition.name, definition.description);
    if let Some(short) = &definition.short_description {
        text.push_str(&format!("\n_{}_\n", short));
    }
    text.push_str(&format!("\n## Input schema\n\n```json\n{}\n```\n", schema));

    let resource = Resource::new(uri, definition.name.clone())
        .with_description(format!("Documentation for tool {}", definition.name))
        .with_mime_type("text/markdown");
    StoredResource { resource, text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler_fn;
    use crate::protocol::CallToolResult;

    fn noop() -> Arc<dyn ToolHandler> {
        handler_fn(|_| async { Ok(CallToolResult::text("ok")) })
    }

    #[test]
    fn test_tool_and_document_registered_together() {
        let registry = Registry::default();
        registry.insert_tool(ToolDefinition::new("nmap", "Port scanner"), noop());

        let resources = registry.resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].uri, "tool://nmap");

        let doc = registry.read_resource("tool://nmap").unwrap();
        assert!(doc.text.unwrap().contains("Port scanner"));
    }

    #[test]
    fn test_reregister_overwrites_definition_and_document() {
        let registry = Registry::default();
        registry.insert_tool(ToolDefinition::new("nmap", "old"), noop());
        let replaced = registry.insert_tool(ToolDefinition::new("nmap", "new"), noop());

        assert!(replaced);
        assert_eq!(registry.definitions().len(), 1);
        assert_eq!(registry.definitions()[0].description, "new");
        let doc = registry.read_resource("tool://nmap").unwrap();
        assert!(doc.text.unwrap().contains("new"));
    }

    #[test]
    fn test_remove_tool_drops_document_only() {
        let registry = Registry::default();
        registry.insert_tool(ToolDefinition::new("nmap", "scan"), noop());
        registry.insert_resource(Resource::new("file:///notes", "notes"), "hello".into());

        assert!(registry.remove_tool("nmap"));
        assert!(!registry.remove_tool("nmap"));

        let uris: Vec<String> = registry.resources().into_iter().map(|r| r.uri).collect();
        assert_eq!(uris, vec!["file:///notes"]);
        assert!(registry.read_resource("tool://nmap").is_none());
    }
}
