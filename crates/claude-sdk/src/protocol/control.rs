use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SdkError};
use crate::permission::{PermissionSuggestion, PermissionUpdate};
use crate::transport::{RawMessage, Transport};

use super::messages::{ControlResponseBody, Message};
use super::parser::parse_message;

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the application-visible message channel. When full, the
/// oldest buffered message is discarded: the stream is a liveness signal,
/// and back-pressuring the framer would stall control responses.
const MESSAGE_CHANNEL_CAPACITY: usize = 100;

// ─── Inbound-request payloads ─────────────────────────────────────────────

/// A `can_use_tool` control request from the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanUseToolRequest {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_suggestions: Vec<PermissionSuggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanUseToolResponse {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_permissions: Vec<PermissionUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupt: bool,
}

/// A `hook_callback` control request from the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookCallbackRequest {
    #[serde(default)]
    pub hook_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Reply body for a hook callback; mirrors the shell-hook output envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCallbackResponse {
    #[serde(rename = "continue")]
    pub should_continue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "stopReason")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "systemMessage"
    )]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HookCallbackResponse {
    pub fn proceed() -> Self {
        HookCallbackResponse {
            should_continue: true,
            stop_reason: None,
            decision: None,
            system_message: None,
            reason: None,
        }
    }
}

/// An `mcp_message` control request: a JSON-RPC message to relay to a named
/// in-process server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMessageRequest {
    #[serde(default)]
    pub server_name: String,
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMessageResponse {
    pub message: Value,
}

// ─── Outbound-request payloads ────────────────────────────────────────────

/// The `initialize` control request opening a streaming session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializeRequest {
    pub subtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fork_session: bool,
    #[serde(rename = "continue", skip_serializing_if = "std::ops::Not::not")]
    pub continue_conversation: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enable_file_checkpointing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterruptRequest {
    pub subtype: String,
}

impl InterruptRequest {
    pub fn new() -> Self {
        InterruptRequest {
            subtype: "interrupt".to_string(),
        }
    }
}

impl Default for InterruptRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Roll tracked files back to the state at a given user turn.
#[derive(Debug, Clone, Serialize)]
pub struct RewindFilesRequest {
    pub subtype: String,
    pub user_message_id: String,
}

impl RewindFilesRequest {
    pub fn new(user_message_id: impl Into<String>) -> Self {
        RewindFilesRequest {
            subtype: "rewind_files".to_string(),
            user_message_id: user_message_id.into(),
        }
    }
}

// ─── Callback types ───────────────────────────────────────────────────────

pub type CanUseToolCallback =
    Arc<dyn Fn(CanUseToolRequest) -> BoxFuture<'static, Result<CanUseToolResponse>> + Send + Sync>;

pub type HookCallback = Arc<
    dyn Fn(HookCallbackRequest) -> BoxFuture<'static, Result<HookCallbackResponse>> + Send + Sync,
>;

pub type McpMessageCallback =
    Arc<dyn Fn(McpMessageRequest) -> BoxFuture<'static, Result<McpMessageResponse>> + Send + Sync>;

// ─── ProtocolHandler ──────────────────────────────────────────────────────

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<ControlResponseBody>>>>;

/// The control plane over a [`Transport`]: correlates outbound control
/// requests with responses by id, dispatches inbound control requests to
/// registered handlers, and forwards everything else to the
/// application-visible message channel.
pub struct ProtocolHandler {
    transport: Arc<dyn Transport>,

    pending: PendingMap,
    counter: AtomicU64,

    can_use_tool: RwLock<Option<CanUseToolCallback>>,
    hook_callbacks: RwLock<HashMap<String, Vec<HookCallback>>>,
    mcp_callback: RwLock<Option<McpMessageCallback>>,

    msg_tx: StdMutex<Option<broadcast::Sender<Message>>>,
    err_tx: StdMutex<Option<mpsc::Sender<SdkError>>>,
    err_rx: StdMutex<Option<mpsc::Receiver<SdkError>>>,
}

/// Removes a pending entry when the waiter gives up for any reason; a reply
/// that raced in first has already taken the slot.
struct PendingGuard {
    pending: PendingMap,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.id);
        }
    }
}

impl ProtocolHandler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (msg_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(16);
        ProtocolHandler {
            transport,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            can_use_tool: RwLock::new(None),
            hook_callbacks: RwLock::new(HashMap::new()),
            mcp_callback: RwLock::new(None),
            msg_tx: StdMutex::new(Some(msg_tx)),
            err_tx: StdMutex::new(Some(err_tx)),
            err_rx: StdMutex::new(Some(err_rx)),
        }
    }

    pub fn set_can_use_tool(&self, cb: CanUseToolCallback) {
        *self.can_use_tool.write().expect("can_use_tool lock") = Some(cb);
    }

    pub fn add_hook_callback(&self, hook_type: impl Into<String>, cb: HookCallback) {
        self.hook_callbacks
            .write()
            .expect("hook_callbacks lock")
            .entry(hook_type.into())
            .or_default()
            .push(cb);
    }

    pub fn set_mcp_callback(&self, cb: McpMessageCallback) {
        *self.mcp_callback.write().expect("mcp_callback lock") = Some(cb);
    }

    /// Subscribe to the application-visible message stream. Subscribers that
    /// fall more than the channel capacity behind lose the oldest messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.msg_tx
            .lock()
            .expect("msg_tx lock")
            .as_ref()
            .expect("subscribing after close")
            .subscribe()
    }

    /// Take the error stream. Returns `None` after the first call.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<SdkError>> {
        self.err_rx.lock().expect("err_rx lock").take()
    }

    /// Push an error to the application-visible error channel.
    pub async fn forward_error(&self, err: SdkError) {
        let tx = self.err_tx.lock().expect("err_tx lock").clone();
        if let Some(tx) = tx {
            let _ = tx.send(err).await;
        }
    }

    // ── Outbound control requests ─────────────────────────────────────────

    /// Send a control request and wait for the correlated response.
    ///
    /// The reply slot is enrolled before the request is written and removed
    /// whether the reply arrives, the timeout fires, or the caller drops the
    /// future.
    pub async fn send_control_request<R: Serialize>(
        &self,
        request: &R,
        timeout: Option<Duration>,
    ) -> Result<ControlResponseBody> {
        let timeout = timeout.unwrap_or(DEFAULT_CONTROL_TIMEOUT);
        let id = format!("sdk-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        let envelope = json!({
            "type": "control_request",
            "request_id": id,
            "request": request,
        });
        let data = serde_json::to_vec(&envelope).map_err(|e| {
            SdkError::with_details("send", ErrorKind::JsonDecode, e.to_string())
        })?;
        self.transport.write(&data).await?;

        tokio::select! {
            resp = rx => resp.map_err(|_| {
                SdkError::with_details("send", ErrorKind::Canceled, "handler closed")
            }),
            _ = tokio::time::sleep(timeout) => {
                debug!(request_id = %id, "control request timed out");
                Err(SdkError::with_details(
                    "send",
                    ErrorKind::ControlTimeout,
                    format!("no response within {timeout:?}"),
                ))
            }
        }
    }

    // ── Inbound dispatch ──────────────────────────────────────────────────

    /// Classify and dispatch one framed message.
    pub async fn handle_incoming(&self, raw: &RawMessage) -> Result<()> {
        let msg = parse_message(&raw.data)?;

        match msg {
            Message::ControlResponse(resp) => {
                self.deliver_response(resp.response);
                Ok(())
            }
            Message::ControlRequest(req) => {
                self.handle_control_request(&req.request_id, &req.request)
                    .await
            }
            other => {
                // Forward to the application channel; send only fails when
                // no subscriber exists, which is fine for one-shot mode.
                if let Some(tx) = self.msg_tx.lock().expect("msg_tx lock").as_ref() {
                    let _ = tx.send(other);
                }
                Ok(())
            }
        }
    }

    fn deliver_response(&self, body: ControlResponseBody) {
        let slot = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(&body.request_id);
        match slot {
            Some(tx) => {
                let _ = tx.send(body);
            }
            // A late response to a request that timed out or was canceled.
            None => debug!(request_id = %body.request_id, "dropping uncorrelated control response"),
        }
    }

    async fn handle_control_request(&self, request_id: &str, request: &Value) -> Result<()> {
        let Some(body) = request.as_object() else {
            return self
                .send_control_error(request_id, "invalid request format")
                .await;
        };
        let subtype = body.get("subtype").and_then(Value::as_str).unwrap_or("");

        match subtype {
            "can_use_tool" => self.handle_can_use_tool(request_id, request).await,
            "hook_callback" => self.handle_hook_callback(request_id, request).await,
            "mcp_message" => self.handle_mcp_message(request_id, request).await,
            other => {
                debug!(subtype = other, "unhandled control request subtype");
                self.send_control_success(request_id, None).await
            }
        }
    }

    async fn handle_can_use_tool(&self, request_id: &str, request: &Value) -> Result<()> {
        let cb = self
            .can_use_tool
            .read()
            .expect("can_use_tool lock")
            .clone();
        let Some(cb) = cb else {
            // No permission callback registered: default-allow.
            let allow = serde_json::to_value(CanUseToolResponse {
                allow: true,
                ..Default::default()
            })
            .expect("serialize allow");
            return self.send_control_success(request_id, Some(allow)).await;
        };

        let req: CanUseToolRequest = match serde_json::from_value(request.clone()) {
            Ok(req) => req,
            Err(e) => {
                return self
                    .send_control_error(request_id, format!("unmarshal request: {e}"))
                    .await;
            }
        };

        match cb(req).await {
            Ok(resp) => {
                let value = serde_json::to_value(resp).expect("serialize permission response");
                self.send_control_success(request_id, Some(value)).await
            }
            Err(e) => self.send_control_error(request_id, e.to_string()).await,
        }
    }

    async fn handle_hook_callback(&self, request_id: &str, request: &Value) -> Result<()> {
        let hook_type = request
            .get("hook_type")
            .and_then(Value::as_str)
            .unwrap_or("");
        let callbacks = self
            .hook_callbacks
            .read()
            .expect("hook_callbacks lock")
            .get(hook_type)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            let proceed = serde_json::to_value(HookCallbackResponse::proceed())
                .expect("serialize hook response");
            return self.send_control_success(request_id, Some(proceed)).await;
        }

        let req: HookCallbackRequest = match serde_json::from_value(request.clone()) {
            Ok(req) => req,
            Err(e) => {
                return self
                    .send_control_error(request_id, format!("unmarshal request: {e}"))
                    .await;
            }
        };

        // Registration order; the first handler that refuses to continue
        // short-circuits the chain with its own output.
        for cb in callbacks {
            match cb(req.clone()).await {
                Ok(resp) if !resp.should_continue => {
                    let value = serde_json::to_value(resp).expect("serialize hook response");
                    return self.send_control_success(request_id, Some(value)).await;
                }
                Ok(_) => {}
                Err(e) => return self.send_control_error(request_id, e.to_string()).await,
            }
        }

        let proceed =
            serde_json::to_value(HookCallbackResponse::proceed()).expect("serialize hook response");
        self.send_control_success(request_id, Some(proceed)).await
    }

    async fn handle_mcp_message(&self, request_id: &str, request: &Value) -> Result<()> {
        let cb = self.mcp_callback.read().expect("mcp_callback lock").clone();
        let Some(cb) = cb else {
            return self
                .send_control_error(request_id, "no MCP message callback")
                .await;
        };

        let req: McpMessageRequest = match serde_json::from_value(request.clone()) {
            Ok(req) => req,
            Err(e) => {
                return self
                    .send_control_error(request_id, format!("unmarshal request: {e}"))
                    .await;
            }
        };

        match cb(req).await {
            Ok(resp) => {
                let value = serde_json::to_value(resp).expect("serialize MCP response");
                self.send_control_success(request_id, Some(value)).await
            }
            Err(e) => self.send_control_error(request_id, e.to_string()).await,
        }
    }

    async fn send_control_success(&self, request_id: &str, response: Option<Value>) -> Result<()> {
        let envelope = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": response,
            },
        });
        let data = serde_json::to_vec(&envelope)
            .map_err(|e| SdkError::with_details("send", ErrorKind::JsonDecode, e.to_string()))?;
        self.transport.write(&data).await
    }

    async fn send_control_error(&self, request_id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        warn!(request_id, %error, "control request failed");
        let envelope = json!({
            "type": "control_response",
            "response": {
                "subtype": "error",
                "request_id": request_id,
                "error": error,
            },
        });
        let data = serde_json::to_vec(&envelope)
            .map_err(|e| SdkError::with_details("send", ErrorKind::JsonDecode, e.to_string()))?;
        self.transport.write(&data).await
    }

    /// Tear down: cancel in-flight control waiters, then close the message
    /// stream. The error channel closes last, when the handler drops.
    pub fn close(&self) {
        self.pending.lock().expect("pending lock").clear();
        self.msg_tx.lock().expect("msg_tx lock").take();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
