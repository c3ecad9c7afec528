use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ErrorKind, Result, SdkError};

use super::{McpMessage, McpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connected,
    Closed,
}

// ─── StdioTransport ───────────────────────────────────────────────────────

/// JSON-lines MCP transport over a child process's stdio.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,

    state: StdMutex<State>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<Lines<BufReader<ChildStdout>>>>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        StdioTransport {
            command: command.into(),
            args,
            env,
            state: StdMutex::new(State::Idle),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        *self.state.lock().expect("state lock")
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        match self.state() {
            State::Connected => {
                return Err(SdkError::new("mcp_connect", ErrorKind::AlreadyConnected))
            }
            // A closed transport stays closed.
            State::Closed => return Err(SdkError::new("mcp_connect", ErrorKind::NotConnected)),
            State::Idle => {}
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SdkError::with_details("mcp_connect", ErrorKind::CliConnection, e.to_string())
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SdkError::with_details("mcp_connect", ErrorKind::CliConnection, "stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SdkError::with_details(
                "mcp_connect",
                ErrorKind::CliConnection,
                "stdout not captured",
            )
        })?;

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());
        *self.child.lock().await = Some(child);
        *self.state.lock().expect("state lock") = State::Connected;

        debug!(command = %self.command, "MCP stdio transport connected");
        Ok(())
    }

    async fn send(&self, msg: &McpMessage) -> Result<()> {
        if self.state() != State::Connected {
            return Err(SdkError::new("mcp_send", ErrorKind::NotConnected));
        }

        let mut data = serde_json::to_vec(msg).map_err(|e| {
            SdkError::with_details("mcp_send", ErrorKind::JsonDecode, e.to_string())
        })?;
        data.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SdkError::new("mcp_send", ErrorKind::NotConnected))?;
        stdin
            .write_all(&data)
            .await
            .map_err(|e| SdkError::io("mcp_send", e))?;
        stdin.flush().await.map_err(|e| SdkError::io("mcp_send", e))
    }

    async fn receive(&self) -> Result<McpMessage> {
        if self.state() != State::Connected {
            return Err(SdkError::new("mcp_receive", ErrorKind::NotConnected));
        }

        let mut guard = self.stdout.lock().await;
        let lines = guard
            .as_mut()
            .ok_or_else(|| SdkError::new("mcp_receive", ErrorKind::NotConnected))?;

        let line = lines
            .next_line()
            .await
            .map_err(|e| SdkError::io("mcp_receive", e))?
            .ok_or_else(|| {
                SdkError::with_details(
                    "mcp_receive",
                    ErrorKind::Io("connection closed".to_string()),
                    "EOF on MCP server stdout",
                )
            })?;

        serde_json::from_str(&line).map_err(|e| {
            SdkError::with_details("mcp_receive", ErrorKind::JsonDecode, e.to_string())
        })
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == State::Closed {
                return Ok(());
            }
            *state = State::Closed;
        }

        // Closing stdin lets a well-behaved server exit on its own.
        self.stdin.lock().await.take();
        self.stdout.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
