use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SdkError};

use super::{McpMessage, McpTransport, ToolInfo, ToolResult, MCP_PROTOCOL_VERSION};

// ─── Handshake payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub tools: Option<ToolsCapability>,
    #[serde(default)]
    pub resources: Option<ResourcesCapability>,
    #[serde(default)]
    pub prompts: Option<PromptsCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolsCapability {
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResourcesCapability {
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PromptsCapability {
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Default, Deserialize)]
struct InitializeResult {
    #[serde(default, rename = "serverInfo")]
    server_info: ServerInfo,
    #[serde(default)]
    capabilities: Capabilities,
}

// ─── Pending-id normalization ─────────────────────────────────────────────

/// Canonical key for a JSON-RPC id: integer encodings (numeric, floating,
/// string-of-digits) collapse to one key so a peer re-encoding our id still
/// correlates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IdKey {
    Int(i64),
    Text(String),
}

fn normalize_id(id: &Value) -> IdKey {
    match id {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                IdKey::Int(i)
            } else if let Some(f) = n.as_f64() {
                IdKey::Int(f as i64)
            } else {
                IdKey::Text(n.to_string())
            }
        }
        Value::String(s) => match s.parse::<i64>() {
            Ok(i) => IdKey::Int(i),
            Err(_) => IdKey::Text(s.clone()),
        },
        other => IdKey::Text(other.to_string()),
    }
}

// ─── McpClient ────────────────────────────────────────────────────────────

type PendingMap = Arc<StdMutex<HashMap<IdKey, oneshot::Sender<McpMessage>>>>;

/// JSON-RPC 2.0 client over any [`McpTransport`].
///
/// `connect` runs the transport's connect, starts a receive fiber that
/// wakes pending callers for responses and queues everything else as
/// events, then performs the initialize handshake.
pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,

    server_info: RwLock<Option<ServerInfo>>,
    capabilities: RwLock<Option<Capabilities>>,

    pending: PendingMap,
    req_id: AtomicI64,
    connected: AtomicBool,

    events_tx: mpsc::Sender<McpMessage>,
    events_rx: Mutex<mpsc::Receiver<McpMessage>>,
    cancel: CancellationToken,
}

impl McpClient {
    pub fn new(name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(100);
        McpClient {
            name: name.into(),
            transport,
            server_info: RwLock::new(None),
            capabilities: RwLock::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            req_id: AtomicI64::new(0),
            connected: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(SdkError::new("mcp_connect", ErrorKind::AlreadyConnected));
        }

        self.transport.connect().await?;
        self.spawn_receive_loop();

        if let Err(e) = self.initialize().await {
            let _ = self.transport.close().await;
            return Err(e);
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_receive_loop(&self) {
        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = transport.receive() => msg,
                };
                let msg = match msg {
                    Ok(msg) => msg,
                    // Connection closed; pending waiters are dropped with
                    // the client.
                    Err(_) => return,
                };

                if msg.is_response() {
                    let key = normalize_id(msg.id.as_ref().expect("response has id"));
                    let slot = pending.lock().expect("pending lock").remove(&key);
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(msg);
                        }
                        None => debug!(?key, "dropping uncorrelated MCP response"),
                    }
                } else if events_tx.try_send(msg).is_err() {
                    warn!("MCP event queue full; dropping notification");
                }
            }
        });
    }

    async fn initialize(&self) -> Result<()> {
        let request = McpMessage::request(
            self.next_id(),
            "initialize",
            Some(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );

        let response = self.request("initialize", request).await?;
        let result: InitializeResult = serde_json::from_value(
            response.result.unwrap_or(Value::Null),
        )
        .map_err(|e| {
            SdkError::with_details("initialize", ErrorKind::JsonDecode, e.to_string())
        })?;

        *self.server_info.write().expect("server_info lock") = Some(result.server_info);
        *self.capabilities.write().expect("capabilities lock") = Some(result.capabilities);

        self.transport
            .send(&McpMessage::notification("notifications/initialized"))
            .await?;

        debug!(client = %self.name, "MCP initialize handshake complete");
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.req_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send a request and wait for its correlated response. RPC error
    /// objects become typed errors carrying code and message.
    async fn request(&self, op: &'static str, msg: McpMessage) -> Result<McpMessage> {
        let key = normalize_id(msg.id.as_ref().expect("request has id"));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(key.clone(), tx);

        if let Err(e) = self.transport.send(&msg).await {
            self.pending.lock().expect("pending lock").remove(&key);
            return Err(e);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().expect("pending lock").remove(&key);
                return Err(SdkError::new(op, ErrorKind::Canceled));
            }
            response = rx => response.map_err(|_| {
                self.pending.lock().expect("pending lock").remove(&key);
                SdkError::with_details(op, ErrorKind::Canceled, "receive loop ended")
            })?,
        };

        if let Some(error) = response.error {
            return Err(SdkError::new(
                op,
                ErrorKind::Rpc {
                    code: error.code,
                    message: error.message,
                },
            ));
        }
        Ok(response)
    }

    fn check_connected(&self, op: &'static str) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SdkError::new(op, ErrorKind::NotConnected))
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        self.check_connected("list_tools")?;

        let request = McpMessage::request(self.next_id(), "tools/list", None);
        let response = self.request("list_tools", request).await?;

        let result = response.result.unwrap_or(Value::Null);
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| {
            SdkError::with_details("list_tools", ErrorKind::JsonDecode, e.to_string())
        })
    }

    pub async fn call_tool(&self, name: &str, args: Map<String, Value>) -> Result<ToolResult> {
        self.check_connected("call_tool")?;

        let request = McpMessage::request(
            self.next_id(),
            "tools/call",
            Some(json!({"name": name, "arguments": args})),
        );
        let response = self.request("call_tool", request).await?;

        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| {
            SdkError::with_details("call_tool", ErrorKind::JsonDecode, e.to_string())
        })
    }

    /// Next server-initiated message (notification or reverse request).
    pub async fn next_event(&self) -> Option<McpMessage> {
        self.events_rx.lock().await.recv().await
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().expect("server_info lock").clone()
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.read().expect("capabilities lock").clone()
    }

    pub async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.transport.close().await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
