//! Tool System
//!
//! The agent reaches tools through a [`ToolHost`]: a remote MCP server in
//! production, or an in-process [`ToolRegistry`]. The host advertises a
//! catalog which is turned into model function declarations on every run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::provider::FunctionDeclaration;
use crate::sampling::CallContext;

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool identifier
    pub name: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub arguments: HashMap<String, Value>,

    /// Optional call ID for tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: HashMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            id: None,
        }
    }
}

/// A catalog entry as advertised by the tool host.
///
/// Kept as raw JSON so that entries with odd shapes survive listing; the
/// accessors extract what the catalog adapter needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolDescriptor(Value);

impl ToolDescriptor {
    pub const fn from_value(raw: Value) -> Self {
        Self(raw)
    }

    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self(serde_json::json!({
            "name": name,
            "description": description,
            "inputSchema": input_schema,
        }))
    }

    /// Tool name, if present and non-empty
    pub fn name(&self) -> Option<&str> {
        self.0
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn description(&self) -> &str {
        self.0.get("description").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn input_schema(&self) -> Option<&Value> {
        self.0.get("inputSchema").filter(|schema| !schema.is_null())
    }

    pub const fn raw(&self) -> &Value {
        &self.0
    }
}

/// Convert a tool host catalog into model function declarations plus a
/// name lookup. Entries without a usable name are dropped.
pub fn build_function_declarations(
    tools: &[ToolDescriptor],
) -> (Vec<FunctionDeclaration>, HashMap<String, ToolDescriptor>) {
    let mut declarations = Vec::with_capacity(tools.len());
    let mut index = HashMap::with_capacity(tools.len());

    for tool in tools {
        let Some(name) = tool.name() else {
            tracing::debug!(entry = %tool.raw(), "Skipping catalog entry without a name");
            continue;
        };
        declarations.push(FunctionDeclaration {
            name: name.to_string(),
            description: tool.description().to_string(),
            parameters: tool.input_schema().cloned(),
        });
        index.insert(name.to_string(), tool.clone());
    }

    (declarations, index)
}

/// Result from a tool host call, in MCP `CallToolResult` shape
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Content parts (`{"type": "text", "text": ...}`, images, resources, ...)
    #[serde(default)]
    pub content: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,

    /// Set by the host when the tool itself reported a failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Single text part result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({"type": "text", "text": text.into()})],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_content(mut self, part: Value) -> Self {
        self.content.push(part);
        self
    }
}

/// Concatenate the non-blank text parts of a result, newline-joined, in order.
/// Non-text parts are ignored.
pub fn extract_tool_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Source of callable tools
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// List callable tools
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Invoke a named tool. `ctx` carries the per-query generation overrides
    /// used if the host asks for a nested generation during the call.
    async fn call_tool(&self, call: &ToolCall, ctx: &CallContext) -> Result<CallToolResult>;
}

/// Tool trait for in-process tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Catalog entry for this tool
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with given arguments
    async fn execute(&self, call: &ToolCall, ctx: &CallContext) -> Result<CallToolResult>;
}

/// Registry of in-process tools, usable wherever a [`ToolHost`] is expected
pub struct ToolRegistry {
    tools: Vec<(String, Arc<dyn Tool>)>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub const fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a new tool; a tool with the same name is replaced
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name().unwrap_or_default().to_string();
        self.tools.retain(|(existing, _)| *existing != name);
        self.tools.push((name, tool));
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, tool)| tool.clone())
    }
}

#[async_trait]
impl ToolHost for ToolRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.iter().map(|(_, tool)| tool.descriptor()).collect())
    }

    async fn call_tool(&self, call: &ToolCall, ctx: &CallContext) -> Result<CallToolResult> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| AgentError::ToolExecution(format!("tool '{}' not found", call.name)))?;
        tool.execute(call, ctx).await
    }
}
