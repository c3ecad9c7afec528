//! Model Context Protocol: a JSON-RPC 2.0 client over stdio or HTTP/SSE,
//! plus an in-process server that answers the CLI's `mcp_message` relay
//! without an external process.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Result;

mod client;
mod http;
mod server;
mod stdio;

pub use client::{Capabilities, McpClient, PromptsCapability, ResourcesCapability, ServerInfo, ToolsCapability};
pub use http::HttpTransport;
pub use server::{SdkMcpServer, Tool, ToolHandler};
pub use stdio::StdioTransport;

/// Protocol version negotiated in the initialize handshake and stamped on
/// HTTP requests.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

// ─── Wire message ─────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 message: request (id + method), response (id + result or
/// error), or notification (method, no id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl McpMessage {
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        McpMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        McpMessage {
            jsonrpc: "2.0".to_string(),
            method: Some(method.into()),
            ..McpMessage::default()
        }
    }

    pub fn response(id: Option<Value>, result: Value) -> Self {
        McpMessage {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            ..McpMessage::default()
        }
    }

    pub fn error_response(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        McpMessage {
            jsonrpc: "2.0".to_string(),
            id,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            ..McpMessage::default()
        }
    }

    /// A response carries an id and no method.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── Tool surface ─────────────────────────────────────────────────────────

/// Tool metadata, as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Outcome of `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: Some(text.into()),
            }],
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// ─── Server configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

/// Configuration for an external MCP server, forwarded to the CLI.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub kind: TransportKind,
    /// stdio only.
    pub command: String,
    pub args: Vec<String>,
    /// sse/http only.
    pub url: String,
    pub headers: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        McpServerConfig {
            kind: TransportKind::Stdio,
            command: command.into(),
            args,
            url: String::new(),
            headers: HashMap::new(),
            env: HashMap::new(),
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        McpServerConfig {
            kind: TransportKind::Http,
            command: String::new(),
            args: Vec::new(),
            url: url.into(),
            headers: HashMap::new(),
            env: HashMap::new(),
        }
    }

    pub fn sse(url: impl Into<String>) -> Self {
        McpServerConfig {
            kind: TransportKind::Sse,
            ..Self::http(url)
        }
    }

    /// The shape the CLI expects inside the initialize request.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "type".to_string(),
            serde_json::to_value(self.kind).expect("serialize transport kind"),
        );
        match self.kind {
            TransportKind::Stdio => {
                if !self.command.is_empty() {
                    map.insert("command".to_string(), Value::from(self.command.clone()));
                }
                if !self.args.is_empty() {
                    map.insert(
                        "args".to_string(),
                        Value::from(self.args.clone()),
                    );
                }
            }
            TransportKind::Sse | TransportKind::Http => {
                if !self.url.is_empty() {
                    map.insert("url".to_string(), Value::from(self.url.clone()));
                }
                if !self.headers.is_empty() {
                    map.insert(
                        "headers".to_string(),
                        json!(self.headers),
                    );
                }
            }
        }
        if !self.env.is_empty() {
            map.insert("env".to_string(), json!(self.env));
        }
        Value::Object(map)
    }
}

// ─── Transport trait ──────────────────────────────────────────────────────

/// A JSON-RPC message pipe to an MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn send(&self, msg: &McpMessage) -> Result<()>;
    /// Blocking receive of the next inbound message.
    async fn receive(&self) -> Result<McpMessage>;
    async fn close(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

// ─── Manager ──────────────────────────────────────────────────────────────

/// Registry of external server configs and in-process servers for one
/// session. External servers are launched by the CLI itself; in-process
/// servers answer `mcp_message` relays here.
pub struct McpManager {
    external: RwLock<HashMap<String, McpServerConfig>>,
    sdk: RwLock<HashMap<String, Arc<SdkMcpServer>>>,
}

impl McpManager {
    pub fn new() -> Self {
        McpManager {
            external: RwLock::new(HashMap::new()),
            sdk: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_external_server(&self, name: impl Into<String>, config: McpServerConfig) {
        self.external
            .write()
            .expect("external lock")
            .insert(name.into(), config);
    }

    pub fn add_sdk_server(&self, server: Arc<SdkMcpServer>) {
        self.sdk
            .write()
            .expect("sdk lock")
            .insert(server.name().to_string(), server);
    }

    pub fn is_empty(&self) -> bool {
        self.external.read().expect("external lock").is_empty()
            && self.sdk.read().expect("sdk lock").is_empty()
    }

    /// The `mcp_servers` map for the initialize request: external configs
    /// verbatim, in-process servers flagged as `{"type": "sdk"}`.
    pub fn build_cli_config(&self) -> Map<String, Value> {
        let mut result = Map::new();
        for (name, config) in self.external.read().expect("external lock").iter() {
            result.insert(name.clone(), config.to_value());
        }
        for name in self.sdk.read().expect("sdk lock").keys() {
            result.insert(name.clone(), json!({"type": "sdk"}));
        }
        result
    }

    /// Route a relayed JSON-RPC message to the named in-process server.
    pub async fn handle_message(&self, server_name: &str, msg: &McpMessage) -> McpMessage {
        let server = self
            .sdk
            .read()
            .expect("sdk lock")
            .get(server_name)
            .cloned();
        match server {
            Some(server) => server.handle_message(msg).await,
            // External servers are the CLI's to talk to, not ours.
            None => McpMessage::error_response(
                msg.id.clone(),
                -32000,
                "server not found or external server",
            ),
        }
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_shapes() {
        let req = McpMessage::request(1, "tools/list", None);
        assert!(!req.is_response());
        assert_eq!(req.jsonrpc, "2.0");

        let notification = McpMessage::notification("notifications/initialized");
        assert!(notification.id.is_none());
        assert!(!notification.is_response());

        let resp = McpMessage::response(Some(Value::from(1)), json!({"ok": true}));
        assert!(resp.is_response());
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = McpMessage::request(7, "tools/call", Some(json!({"name": "echo"})));
        let text = serde_json::to_string(&msg).unwrap();
        let back: McpMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, back);
        // Notifications serialize without an id key at all.
        let text = serde_json::to_string(&McpMessage::notification("x")).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn stdio_config_to_value() {
        let config = McpServerConfig::stdio("node", vec!["server.js".to_string()]);
        let value = config.to_value();
        assert_eq!(value["type"], "stdio");
        assert_eq!(value["command"], "node");
        assert_eq!(value["args"][0], "server.js");
        assert!(value.get("url").is_none());
    }

    #[test]
    fn http_config_to_value() {
        let mut config = McpServerConfig::http("http://localhost:9000/mcp");
        config
            .headers
            .insert("Authorization".to_string(), "Bearer x".to_string());
        let value = config.to_value();
        assert_eq!(value["type"], "http");
        assert_eq!(value["url"], "http://localhost:9000/mcp");
        assert_eq!(value["headers"]["Authorization"], "Bearer x");
    }

    #[tokio::test]
    async fn manager_builds_cli_config_with_sdk_flag() {
        let manager = McpManager::new();
        manager.add_external_server("files", McpServerConfig::stdio("fileserver", vec![]));
        manager.add_sdk_server(Arc::new(SdkMcpServer::new("inproc", "1.0")));

        let config = manager.build_cli_config();
        assert_eq!(config["files"]["type"], "stdio");
        assert_eq!(config["inproc"]["type"], "sdk");
    }

    #[tokio::test]
    async fn manager_routes_unknown_server_to_rpc_error() {
        let manager = McpManager::new();
        let msg = McpMessage::request(1, "tools/list", None);
        let resp = manager.handle_message("ghost", &msg).await;
        assert_eq!(resp.error.as_ref().unwrap().code, -32000);
        assert_eq!(resp.id, Some(Value::from(1)));
    }
}
