use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::Result;

use super::{McpMessage, ToolInfo, ToolResult};

pub type ToolHandler =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<ToolResult>> + Send + Sync>;

/// A tool served by an in-process MCP server.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: ToolHandler,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: ToolHandler,
    ) -> Self {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }
}

// ─── SdkMcpServer ─────────────────────────────────────────────────────────

/// The server side of the MCP protocol, living in this process. The CLI
/// relays JSON-RPC requests for it over `mcp_message` control requests.
pub struct SdkMcpServer {
    name: String,
    version: String,
    tools: RwLock<HashMap<String, Tool>>,
}

impl SdkMcpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        SdkMcpServer {
            name: name.into(),
            version: version.into(),
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn add_tool(&self, tool: Tool) {
        self.tools
            .write()
            .expect("tools lock")
            .insert(tool.name.clone(), tool);
    }

    pub fn remove_tool(&self, name: &str) {
        self.tools.write().expect("tools lock").remove(name);
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .read()
            .expect("tools lock")
            .values()
            .map(|tool| ToolInfo {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Dispatch one JSON-RPC request and build its response.
    pub async fn handle_message(&self, msg: &McpMessage) -> McpMessage {
        match msg.method.as_deref() {
            Some("tools/list") => {
                let tools = self.list_tools();
                McpMessage::response(msg.id.clone(), json!({ "tools": tools }))
            }
            Some("tools/call") => {
                let Some(params) = msg.params.as_ref().and_then(Value::as_object) else {
                    return McpMessage::error_response(msg.id.clone(), -32600, "invalid params");
                };
                let tool_name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let args = params
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();

                let handler = self
                    .tools
                    .read()
                    .expect("tools lock")
                    .get(tool_name)
                    .map(|tool| Arc::clone(&tool.handler));
                let Some(handler) = handler else {
                    return McpMessage::error_response(
                        msg.id.clone(),
                        -32601,
                        format!("tool not found: {tool_name}"),
                    );
                };

                debug!(server = %self.name, tool = tool_name, "tools/call");
                match handler(args).await {
                    Ok(result) => McpMessage::response(
                        msg.id.clone(),
                        json!({
                            "content": result.content,
                            "isError": result.is_error,
                        }),
                    ),
                    Err(e) => McpMessage::error_response(msg.id.clone(), -32000, e.to_string()),
                }
            }
            _ => McpMessage::error_response(msg.id.clone(), -32601, "method not found"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
