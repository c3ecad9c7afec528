use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SdkError};

use super::{McpMessage, McpTransport, MCP_PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connected,
    Closed,
}

// ─── HttpTransport ────────────────────────────────────────────────────────

/// MCP transport over HTTP, with an optional server-sent-events stream for
/// server-initiated messages.
///
/// Every `send` POSTs one JSON-RPC message with the MCP protocol headers;
/// the first response's `Mcp-Session-Id` is captured and echoed on every
/// subsequent request. In SSE mode a background reader decodes `data:`
/// events onto the same inbound queue the POST responses land on.
pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    use_sse: bool,

    client: reqwest::Client,
    session_id: StdMutex<Option<String>>,
    state: StdMutex<State>,
    msg_tx: mpsc::Sender<McpMessage>,
    msg_rx: Mutex<mpsc::Receiver<McpMessage>>,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self::build(url, headers, false)
    }

    /// An SSE-mode transport: a GET stream is opened at connect time for
    /// server-initiated messages.
    pub fn new_sse(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self::build(url, headers, true)
    }

    fn build(url: impl Into<String>, headers: HashMap<String, String>, use_sse: bool) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(100);
        HttpTransport {
            url: url.into(),
            headers,
            use_sse,
            client: reqwest::Client::new(),
            session_id: StdMutex::new(None),
            state: StdMutex::new(State::Idle),
            msg_tx,
            msg_rx: Mutex::new(msg_rx),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> State {
        *self.state.lock().expect("state lock")
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session_id lock").clone()
    }

    fn spawn_sse_reader(&self) {
        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        let msg_tx = self.msg_tx.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut request = client
                .get(&url)
                .header("Accept", "text/event-stream")
                .header("Cache-Control", "no-cache");
            for (k, v) in &headers {
                request = request.header(k, v);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = request.send() => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "SSE connect failed");
                    return;
                }
            };

            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                let chunk: bytes::Bytes = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        warn!(error = %e, "SSE stream error");
                        return;
                    }
                    None => return,
                };
                buffer.extend_from_slice(&chunk);

                // Process complete lines; an SSE event's payload is one
                // `data: <json>` line.
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match serde_json::from_str::<McpMessage>(data.trim()) {
                        Ok(msg) => {
                            if msg_tx.try_send(msg).is_err() {
                                warn!("inbound MCP queue full; dropping SSE message");
                            }
                        }
                        Err(e) => debug!(error = %e, "skipping undecodable SSE event"),
                    }
                }
            }
        });
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            match *state {
                State::Connected => {
                    return Err(SdkError::new("mcp_connect", ErrorKind::AlreadyConnected))
                }
                State::Closed => {
                    return Err(SdkError::new("mcp_connect", ErrorKind::NotConnected))
                }
                State::Idle => *state = State::Connected,
            }
        }

        if self.use_sse {
            self.spawn_sse_reader();
        }
        Ok(())
    }

    async fn send(&self, msg: &McpMessage) -> Result<()> {
        if self.state() != State::Connected {
            return Err(SdkError::new("mcp_send", ErrorKind::NotConnected));
        }

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .json(msg);
        for (k, v) in &self.headers {
            request = request.header(k, v);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header("Mcp-Session-Id", session_id);
        }

        let response = request.send().await.map_err(|e| {
            SdkError::with_details("mcp_send", ErrorKind::Io(e.to_string()), self.url.clone())
        })?;

        // The session id is sticky from the first response onward.
        if let Some(session_id) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session_id lock") = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::with_details(
                "mcp_send",
                ErrorKind::Io(format!("server returned status {status}")),
                body,
            ));
        }

        // Notifications may get an empty reply; everything else is one
        // JSON-RPC message routed onto the inbound queue.
        let body = response
            .bytes()
            .await
            .map_err(|e| SdkError::with_details("mcp_send", ErrorKind::Io(e.to_string()), ""))?;
        if body.is_empty() {
            return Ok(());
        }
        let reply: McpMessage = serde_json::from_slice(&body).map_err(|e| {
            SdkError::with_details("mcp_send", ErrorKind::JsonDecode, e.to_string())
        })?;
        if self.msg_tx.try_send(reply).is_err() {
            warn!("inbound MCP queue full; dropping HTTP response");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<McpMessage> {
        if self.state() != State::Connected {
            return Err(SdkError::new("mcp_receive", ErrorKind::NotConnected));
        }

        let mut rx = self.msg_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(SdkError::new("mcp_receive", ErrorKind::NotConnected))
            }
            msg = rx.recv() => msg.ok_or_else(|| {
                SdkError::with_details(
                    "mcp_receive",
                    ErrorKind::Io("connection closed".to_string()),
                    "inbound queue closed",
                )
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == State::Closed {
                return Ok(());
            }
            *state = State::Closed;
        }
        self.cancel.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;

    /// Serve a router on an ephemeral local port.
    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn post_reply_lands_on_the_inbound_queue() {
        let router = Router::new().route(
            "/mcp",
            post(|Json(msg): Json<McpMessage>| async move {
                Json(McpMessage::response(msg.id, json!({"pong": true})))
            }),
        );
        let addr = serve(router).await;

        let transport = HttpTransport::new(format!("http://{addr}/mcp"), HashMap::new());
        transport.connect().await.unwrap();
        transport
            .send(&McpMessage::request(1, "ping", None))
            .await
            .unwrap();

        let reply = transport.receive().await.unwrap();
        assert_eq!(reply.result.unwrap()["pong"], true);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn protocol_headers_are_sent() {
        let seen: Arc<StdMutex<Vec<(Option<String>, Option<String>)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let router = Router::new().route(
            "/mcp",
            post(move |headers: HeaderMap, Json(msg): Json<McpMessage>| {
                let recorder = recorder.clone();
                async move {
                    let version = headers
                        .get("mcp-protocol-version")
                        .map(|v| v.to_str().unwrap().to_string());
                    let accept = headers
                        .get("accept")
                        .map(|v| v.to_str().unwrap().to_string());
                    recorder.lock().unwrap().push((version, accept));
                    Json(McpMessage::response(msg.id, json!({})))
                }
            }),
        );
        let addr = serve(router).await;

        let transport = HttpTransport::new(format!("http://{addr}/mcp"), HashMap::new());
        transport.connect().await.unwrap();
        transport
            .send(&McpMessage::request(1, "ping", None))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0].0.as_deref(), Some(MCP_PROTOCOL_VERSION));
        assert_eq!(
            seen[0].1.as_deref(),
            Some("application/json, text/event-stream")
        );
    }

    #[tokio::test]
    async fn session_id_is_sticky_after_first_response() {
        let seen: Arc<StdMutex<Vec<Option<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let router = Router::new().route(
            "/mcp",
            post(move |headers: HeaderMap, Json(msg): Json<McpMessage>| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(
                        headers
                            .get("mcp-session-id")
                            .map(|v| v.to_str().unwrap().to_string()),
                    );
                    (
                        [("Mcp-Session-Id", "sess-42")],
                        Json(McpMessage::response(msg.id, json!({}))),
                    )
                        .into_response()
                }
            }),
        );
        let addr = serve(router).await;

        let transport = HttpTransport::new(format!("http://{addr}/mcp"), HashMap::new());
        transport.connect().await.unwrap();
        transport
            .send(&McpMessage::request(1, "ping", None))
            .await
            .unwrap();
        transport
            .send(&McpMessage::request(2, "ping", None))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_deref(), Some("sess-42"));
        assert_eq!(transport.session_id().as_deref(), Some("sess-42"));
    }

    #[tokio::test]
    async fn caller_headers_are_forwarded() {
        let seen: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let recorder = seen.clone();
        let router = Router::new().route(
            "/mcp",
            post(move |headers: HeaderMap, Json(msg): Json<McpMessage>| {
                let recorder = recorder.clone();
                async move {
                    *recorder.lock().unwrap() = headers
                        .get("authorization")
                        .map(|v| v.to_str().unwrap().to_string());
                    Json(McpMessage::response(msg.id, json!({})))
                }
            }),
        );
        let addr = serve(router).await;

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer token-1".to_string());
        let transport = HttpTransport::new(format!("http://{addr}/mcp"), headers);
        transport.connect().await.unwrap();
        transport
            .send(&McpMessage::request(1, "ping", None))
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("Bearer token-1"));
    }

    #[tokio::test]
    async fn http_error_status_is_surfaced() {
        let router = Router::new().route(
            "/mcp",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream died") }),
        );
        let addr = serve(router).await;

        let transport = HttpTransport::new(format!("http://{addr}/mcp"), HashMap::new());
        transport.connect().await.unwrap();
        let err = transport
            .send(&McpMessage::request(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
        assert!(err.details.unwrap().contains("upstream died"));
    }

    #[tokio::test]
    async fn sse_events_reach_the_inbound_queue() {
        let router = Router::new().route(
            "/mcp",
            get(|| async {
                let body = concat!(
                    "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n",
                    "\n",
                    "data: {\"jsonrpc\":\"2.0\",\"id\":9,\"result\":{\"ok\":true}}\n",
                    "\n",
                );
                ([("Content-Type", "text/event-stream")], body)
            }),
        );
        let addr = serve(router).await;

        let transport = HttpTransport::new_sse(format!("http://{addr}/mcp"), HashMap::new());
        transport.connect().await.unwrap();

        let first = transport.receive().await.unwrap();
        assert_eq!(
            first.method.as_deref(),
            Some("notifications/tools/list_changed")
        );
        let second = transport.receive().await.unwrap();
        assert_eq!(second.id, Some(serde_json::Value::from(9)));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let transport = HttpTransport::new("http://127.0.0.1:1/mcp", HashMap::new());
        let err = transport
            .send(&McpMessage::notification("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn close_cancels_receive() {
        let transport = HttpTransport::new("http://127.0.0.1:1/mcp", HashMap::new());
        transport.connect().await.unwrap();
        let receive = {
            // Pre-close receive blocks on the empty queue until cancel fires.
            let fut = transport.receive();
            tokio::time::timeout(std::time::Duration::from_millis(50), fut)
        };
        let _ = receive.await; // times out; queue is empty
        transport.close().await.unwrap();
        let err = transport.receive().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }
}
