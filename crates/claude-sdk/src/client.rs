use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ErrorKind, Result, SdkError};
use crate::hooks::{self, Event, Matcher};
use crate::mcp::{McpManager, McpMessage};
use crate::options::{HookAction, HookConfig, Options};
use crate::permission::{Evaluator, PermissionMode, ToolPermissionContext};
use crate::protocol::{
    CanUseToolResponse, HookCallbackResponse, InitializeRequest, InterruptRequest, Message,
    ProtocolHandler, RewindFilesRequest,
};
use crate::transport::{Config, RawMessage, SubprocessTransport, Transport};

// ─── Connection state ─────────────────────────────────────────────────────

enum ConnState {
    Disconnected,
    Connected {
        transport: Arc<SubprocessTransport>,
        protocol: Arc<ProtocolHandler>,
    },
    Closed,
}

struct Inner {
    opts: Options,
    /// Coarse lock for connection state transitions only; never held
    /// across I/O.
    state: StdMutex<ConnState>,
    hook_manager: Arc<hooks::Manager>,
    mcp_manager: Arc<McpManager>,
    evaluator: Arc<Evaluator>,
    /// Write-once cell, readable without the state lock. The receive loop
    /// populates it while `connect` is still in flight, so it must not
    /// depend on the coarse lock.
    session_id: OnceLock<String>,
    cancel: CancellationToken,
}

// ─── Client ───────────────────────────────────────────────────────────────

/// Streaming session client: connect → initialize → duplex streaming.
///
/// ```rust,ignore
/// use claude_sdk::{Client, Options};
///
/// let client = Client::new(Options::default());
/// let mut stream = client.connect().await?;
/// stream.send("List the files in this directory.").await?;
/// while let Some(msg) = stream.next_message().await {
///     // ...
/// }
/// stream.close().await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(opts: Options) -> Self {
        let hook_manager = Arc::new(hooks::Manager::new());
        if let Some(config) = &opts.hooks {
            register_hooks(&hook_manager, config);
        }

        let mcp_manager = Arc::new(McpManager::new());
        for (name, config) in &opts.mcp_servers {
            mcp_manager.add_external_server(name.clone(), config.clone());
        }
        for server in &opts.sdk_mcp_servers {
            mcp_manager.add_sdk_server(Arc::clone(server));
        }

        let evaluator = Arc::new(Evaluator::new(opts.permission_mode));
        for rule in &opts.permission_rules {
            evaluator.add_rule(rule.clone());
        }
        if let Some(callback) = &opts.can_use_tool {
            evaluator.set_callback(Arc::clone(callback));
        }

        Client {
            inner: Arc::new(Inner {
                opts,
                state: StdMutex::new(ConnState::Disconnected),
                hook_manager,
                mcp_manager,
                evaluator,
                session_id: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the CLI in duplex mode, start the receive loop, and run the
    /// `initialize` handshake.
    ///
    /// `session_id()` stays not-ready until the CLI's first identifying
    /// message arrives.
    pub async fn connect(&self) -> Result<Stream> {
        {
            let state = self.inner.state.lock().expect("state lock");
            match *state {
                ConnState::Disconnected => {}
                ConnState::Connected { .. } => {
                    return Err(SdkError::new("connect", ErrorKind::AlreadyConnected))
                }
                ConnState::Closed => {
                    return Err(SdkError::new("connect", ErrorKind::NotConnected))
                }
            }
        }

        let opts = &self.inner.opts;
        let config = Config {
            cli_path: opts
                .cli_path
                .clone()
                .unwrap_or_else(|| crate::transport::DEFAULT_CLI_PATH.to_string()),
            cwd: opts.cwd.clone(),
            streaming_mode: true,
            permission_prompt_tool: opts.permission_prompt_tool.clone(),
            args: Vec::new(),
            env: opts.env.clone(),
            max_buffer_size: opts.effective_max_buffer_size(),
        };

        let transport = Arc::new(SubprocessTransport::new(config));
        transport.connect().await?;

        let protocol = Arc::new(ProtocolHandler::new(
            Arc::clone(&transport) as Arc<dyn Transport>
        ));
        self.wire_permissions(&protocol);
        self.wire_hooks(&protocol);
        self.wire_mcp(&protocol);

        // Subscribe before the receive loop starts so nothing is missed.
        let messages = protocol.subscribe_messages();
        let errors = protocol
            .take_errors()
            .expect("error stream taken once per connection");

        let raw_messages = transport
            .take_messages()
            .expect("message stream taken once per connection");
        let raw_errors = transport
            .take_errors()
            .expect("transport errors taken once per connection");
        self.spawn_receive_loop(Arc::clone(&protocol), raw_messages, raw_errors);

        if let Err(e) = self.initialize(&protocol).await {
            let _ = transport.close().await;
            return Err(e);
        }

        *self.inner.state.lock().expect("state lock") = ConnState::Connected {
            transport,
            protocol,
        };

        Ok(Stream {
            client: self.clone(),
            messages,
            errors,
        })
    }

    fn wire_permissions(&self, protocol: &ProtocolHandler) {
        let evaluator = Arc::clone(&self.inner.evaluator);
        protocol.set_can_use_tool(Arc::new(move |req| {
            let evaluator = Arc::clone(&evaluator);
            Box::pin(async move {
                let context = ToolPermissionContext {
                    session_id: req.session_id.unwrap_or_default(),
                    permission_suggestions: req.permission_suggestions,
                    blocked_path: req.blocked_path,
                };
                let verdict = evaluator
                    .evaluate(&req.tool_name, req.input, context)
                    .await?;
                Ok(CanUseToolResponse {
                    allow: verdict.allow,
                    updated_input: verdict.updated_input,
                    updated_permissions: verdict.updated_permissions,
                    message: verdict.message,
                    interrupt: verdict.interrupt,
                })
            })
        }));
    }

    fn wire_hooks(&self, protocol: &ProtocolHandler) {
        let cwd = self
            .inner
            .opts
            .cwd
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        for event in Event::ALL {
            if !self.inner.hook_manager.has_hooks(event) {
                continue;
            }
            let manager = Arc::clone(&self.inner.hook_manager);
            let cwd = cwd.clone();
            protocol.add_hook_callback(
                event.as_str(),
                Arc::new(move |req| {
                    let manager = Arc::clone(&manager);
                    let cwd = cwd.clone();
                    Box::pin(async move {
                        let Some(event) = Event::from_name(&req.hook_type) else {
                            return Ok(HookCallbackResponse::proceed());
                        };
                        let input = hooks::Input {
                            session_id: req.session_id.unwrap_or_default(),
                            cwd,
                            tool_name: req.tool_name.unwrap_or_default(),
                            tool_input: req.input,
                            tool_output: req.output,
                            ..hooks::Input::default()
                        };
                        let output = manager.trigger(event, input).await?;
                        Ok(hook_response(output))
                    })
                }),
            );
        }
    }

    fn wire_mcp(&self, protocol: &ProtocolHandler) {
        if self.inner.mcp_manager.is_empty() {
            return;
        }
        let manager = Arc::clone(&self.inner.mcp_manager);
        protocol.set_mcp_callback(Arc::new(move |req| {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                let msg: McpMessage = serde_json::from_value(req.message).map_err(|e| {
                    SdkError::with_details("mcp_message", ErrorKind::JsonDecode, e.to_string())
                })?;
                let response = manager.handle_message(&req.server_name, &msg).await;
                Ok(crate::protocol::McpMessageResponse {
                    message: serde_json::to_value(response).map_err(|e| {
                        SdkError::with_details(
                            "mcp_message",
                            ErrorKind::JsonDecode,
                            e.to_string(),
                        )
                    })?,
                })
            })
        }));
    }

    fn spawn_receive_loop(
        &self,
        protocol: Arc<ProtocolHandler>,
        mut raw_messages: mpsc::Receiver<RawMessage>,
        mut raw_errors: mpsc::Receiver<SdkError>,
    ) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.child_token();

        tokio::spawn(async move {
            let mut errors_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    err = raw_errors.recv(), if errors_open => match err {
                        Some(err) => protocol.forward_error(err).await,
                        None => errors_open = false,
                    },
                    raw = raw_messages.recv() => match raw {
                        None => {
                            // Framer is done. Drain the exit waiter's final
                            // error before shutting the loop down; its
                            // channel closes once the waiter finishes.
                            if errors_open {
                                while let Some(err) = raw_errors.recv().await {
                                    protocol.forward_error(err).await;
                                }
                            }
                            break;
                        }
                        Some(raw) => {
                            extract_session_id(&inner.session_id, &raw);
                            if let Err(e) = protocol.handle_incoming(&raw).await {
                                protocol.forward_error(e).await;
                            }
                        }
                    },
                }
            }
        });
    }

    async fn initialize(&self, protocol: &ProtocolHandler) -> Result<()> {
        let opts = &self.inner.opts;
        let request = InitializeRequest {
            subtype: "initialize".to_string(),
            system_prompt: opts.system_prompt.clone(),
            append_system_prompt: opts.append_system_prompt.clone(),
            mcp_servers: (!self.inner.mcp_manager.is_empty())
                .then(|| self.inner.mcp_manager.build_cli_config()),
            allowed_tools: opts.allowed_tools.clone(),
            disallowed_tools: opts.disallowed_tools.clone(),
            permission_mode: (opts.permission_mode != PermissionMode::Default)
                .then(|| opts.permission_mode.as_str().to_string()),
            model: opts.model.clone(),
            max_turns: opts.max_turns,
            max_budget_usd: opts.max_budget_usd,
            resume: opts.resume.clone(),
            fork_session: opts.fork_session,
            continue_conversation: opts.continue_conversation,
            enable_file_checkpointing: opts.enable_file_checkpointing,
        };

        let body = protocol
            .send_control_request(&request, None)
            .await
            .map_err(|mut e| {
                e.op = "initialize";
                e
            })?;
        if body.subtype == "error" {
            return Err(SdkError::with_details(
                "initialize",
                ErrorKind::CliConnection,
                body.error.unwrap_or_else(|| "initialization failed".to_string()),
            ));
        }

        // One of several places the session id can first appear.
        if let Some(Value::Object(response)) = &body.response {
            if let Some(session_id) = response.get("session_id").and_then(Value::as_str) {
                if !session_id.is_empty() {
                    let _ = self.inner.session_id.set(session_id.to_string());
                }
            }
        }
        debug!("streaming session initialized");
        Ok(())
    }

    fn connection(
        &self,
        op: &'static str,
    ) -> Result<(Arc<SubprocessTransport>, Arc<ProtocolHandler>)> {
        match &*self.inner.state.lock().expect("state lock") {
            ConnState::Connected {
                transport,
                protocol,
            } => Ok((Arc::clone(transport), Arc::clone(protocol))),
            _ => Err(SdkError::new(op, ErrorKind::NotConnected)),
        }
    }

    /// Send a user prompt. The `UserPromptSubmit` hook chain runs first and
    /// may block the send.
    pub async fn send(&self, content: &str) -> Result<()> {
        let (transport, _) = self.connection("send")?;
        let session_id = self.session_id_string();

        let input = hooks::Input {
            session_id: session_id.clone(),
            cwd: self
                .inner
                .opts
                .cwd
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ..hooks::Input::default()
        };
        let output = self
            .inner
            .hook_manager
            .trigger(Event::UserPromptSubmit, input)
            .await?;
        if !output.should_continue {
            return Err(SdkError::with_details(
                "send",
                ErrorKind::BlockedByHook,
                output.reason.unwrap_or_default(),
            ));
        }

        let msg = json!({
            "type": "user",
            "message": {"role": "user", "content": content},
            "session_id": session_id,
        });
        let data = serde_json::to_vec(&msg)
            .map_err(|e| SdkError::with_details("send", ErrorKind::JsonDecode, e.to_string()))?;
        transport.write(&data).await
    }

    /// Send a tool result as a user message referencing the original
    /// tool-use id.
    pub async fn send_tool_result(
        &self,
        tool_use_id: &str,
        result: Value,
        is_error: bool,
    ) -> Result<()> {
        let (transport, _) = self.connection("send")?;
        let session_id = self.session_id_string();

        let msg = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": result,
                    "is_error": is_error,
                }],
            },
            "session_id": session_id,
            "parent_tool_use_id": tool_use_id,
        });
        let data = serde_json::to_vec(&msg)
            .map_err(|e| SdkError::with_details("send", ErrorKind::JsonDecode, e.to_string()))?;
        transport.write(&data).await
    }

    /// Interrupt the in-flight turn.
    pub async fn interrupt(&self) -> Result<()> {
        let (_, protocol) = self.connection("interrupt")?;
        let body = protocol
            .send_control_request(&InterruptRequest::new(), None)
            .await
            .map_err(|mut e| {
                e.op = "interrupt";
                e
            })?;
        if body.subtype == "error" {
            return Err(SdkError::with_details(
                "interrupt",
                ErrorKind::Interrupted,
                body.error.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Roll tracked files back to the state at the given user message.
    pub async fn rewind_files(&self, user_message_id: &str) -> Result<()> {
        let (_, protocol) = self.connection("rewind_files")?;
        let body = protocol
            .send_control_request(&RewindFilesRequest::new(user_message_id), None)
            .await
            .map_err(|mut e| {
                e.op = "rewind_files";
                e
            })?;
        if body.subtype == "error" {
            return Err(SdkError::with_details(
                "rewind_files",
                ErrorKind::SessionNotFound,
                body.error.unwrap_or_else(|| "rewind failed".to_string()),
            ));
        }
        Ok(())
    }

    /// The session id, once the CLI has identified the conversation.
    pub fn session_id(&self) -> Result<String> {
        self.inner
            .session_id
            .get()
            .cloned()
            .ok_or_else(|| SdkError::new("session_id", ErrorKind::SessionIdNotReady))
    }

    pub fn session_id_ready(&self) -> bool {
        self.inner.session_id.get().is_some()
    }

    fn session_id_string(&self) -> String {
        self.inner.session_id.get().cloned().unwrap_or_default()
    }

    /// Tear down the connection. Idempotent; pending control requests are
    /// canceled and the error channel closes last.
    pub async fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.lock().expect("state lock");
            std::mem::replace(&mut *state, ConnState::Closed)
        };
        match previous {
            ConnState::Connected {
                transport,
                protocol,
            } => {
                self.inner.cancel.cancel();
                protocol.close();
                transport.close().await
            }
            _ => Ok(()),
        }
    }
}

// ─── Stream ───────────────────────────────────────────────────────────────

/// Handle to a live streaming session: the message/error streams plus the
/// send-side surface.
pub struct Stream {
    client: Client,
    messages: broadcast::Receiver<Message>,
    errors: mpsc::Receiver<SdkError>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Stream {
    /// Next message from the CLI, or `None` once the stream has closed.
    /// Lag caused by a slow consumer drops the oldest buffered messages.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.messages.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(dropped = n, "slow consumer; dropped buffered messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next transport or dispatch error, or `None` once the channel closes.
    pub async fn next_error(&mut self) -> Option<SdkError> {
        self.errors.recv().await
    }

    pub async fn send(&self, content: &str) -> Result<()> {
        self.client.send(content).await
    }

    pub async fn send_tool_result(
        &self,
        tool_use_id: &str,
        result: Value,
        is_error: bool,
    ) -> Result<()> {
        self.client
            .send_tool_result(tool_use_id, result, is_error)
            .await
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.client.interrupt().await
    }

    pub async fn rewind_files(&self, user_message_id: &str) -> Result<()> {
        self.client.rewind_files(user_message_id).await
    }

    pub fn session_id(&self) -> Result<String> {
        self.client.session_id()
    }

    pub fn session_id_ready(&self) -> bool {
        self.client.session_id_ready()
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────

fn register_hooks(manager: &hooks::Manager, config: &HookConfig) {
    let groups = [
        (Event::PreToolUse, &config.pre_tool_use),
        (Event::PostToolUse, &config.post_tool_use),
        (Event::UserPromptSubmit, &config.user_prompt_submit),
        (Event::Stop, &config.stop),
        (Event::SubagentStop, &config.subagent_stop),
        (Event::PreCompact, &config.pre_compact),
        (Event::Notification, &config.notification),
    ];
    for (event, entries) in groups {
        for entry in entries {
            let action = match &entry.action {
                HookAction::Callback(cb) => hooks::Action::Callback(Arc::clone(cb)),
                HookAction::Command(cmd) => hooks::Action::Command(cmd.clone()),
            };
            manager.register(
                event,
                hooks::Entry {
                    action,
                    matcher: entry.matcher.as_deref().map(Matcher::new),
                    timeout: entry.timeout.unwrap_or(hooks::DEFAULT_HOOK_TIMEOUT),
                },
            );
        }
    }
}

fn hook_response(output: hooks::Output) -> HookCallbackResponse {
    HookCallbackResponse {
        should_continue: output.should_continue,
        stop_reason: output.stop_reason,
        decision: output.decision,
        system_message: output.system_message,
        reason: output.reason,
    }
}

/// First-write-wins session-id extraction from a framed message: a
/// `result` message's `session_id`, or a `system` message's
/// `data.session_id`. Returns whether this call set the cell.
pub(crate) fn extract_session_id(cell: &OnceLock<String>, raw: &RawMessage) -> bool {
    if cell.get().is_some() {
        return false;
    }
    let session_id = match raw.msg_type.as_str() {
        "result" => raw.data.get("session_id").and_then(Value::as_str),
        "system" => raw
            .data
            .get("data")
            .and_then(Value::as_object)
            .and_then(|data| data.get("session_id"))
            .and_then(Value::as_str),
        _ => None,
    };
    match session_id {
        Some(id) if !id.is_empty() => cell.set(id.to_string()).is_ok(),
        _ => false,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
