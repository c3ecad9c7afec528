use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SdkError};

use super::{Config, ProcessStatus, RawMessage, Transport, RAW_CHANNEL_CAPACITY};

/// Value of `CLAUDE_CODE_ENTRYPOINT` identifying this library to the CLI.
const SDK_ENTRYPOINT: &str = "sdk-rust";

// ─── SubprocessTransport ──────────────────────────────────────────────────

/// Hosts the Claude CLI as a child process speaking newline-delimited JSON
/// over stdio.
///
/// `connect` spawns the child with `--output-format stream-json --verbose`
/// (plus `--input-format stream-json` in duplex mode) and starts three
/// workers: a stdout framer that accumulates lines until they parse as one
/// JSON object, a stderr collector feeding an in-memory scrollback, and an
/// exit waiter that records the post-mortem status.
pub struct SubprocessTransport {
    config: Config,

    msg_tx: StdMutex<Option<mpsc::Sender<RawMessage>>>,
    msg_rx: StdMutex<Option<mpsc::Receiver<RawMessage>>>,
    err_tx: StdMutex<Option<mpsc::Sender<SdkError>>>,
    err_rx: StdMutex<Option<mpsc::Receiver<SdkError>>>,

    /// Serializes all writes so the child never sees interleaved objects.
    stdin: Mutex<Option<ChildStdin>>,

    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    status: Arc<StdMutex<Option<ProcessStatus>>>,
    stderr_buf: Arc<StdMutex<String>>,
    cancel: CancellationToken,
}

impl SubprocessTransport {
    pub fn new(config: Config) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(16);
        SubprocessTransport {
            config,
            msg_tx: StdMutex::new(Some(msg_tx)),
            msg_rx: StdMutex::new(Some(msg_rx)),
            err_tx: StdMutex::new(Some(err_tx)),
            err_rx: StdMutex::new(Some(err_rx)),
            stdin: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            status: Arc::new(StdMutex::new(None)),
            stderr_buf: Arc::new(StdMutex::new(String::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Fixed leading flags, then mode flags, then caller-supplied args.
    pub(crate) fn build_args(config: &Config) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if config.streaming_mode {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        }
        if let Some(tool) = &config.permission_prompt_tool {
            args.push("--permission-prompt-tool".to_string());
            args.push(tool.clone());
        }
        args.extend(config.args.iter().cloned());
        args
    }

    fn spawn_framer(
        &self,
        stdout: ChildStdout,
        msg_tx: mpsc::Sender<RawMessage>,
        err_tx: mpsc::Sender<SdkError>,
    ) {
        let cancel = self.cancel.child_token();
        let max_buffer_size = self.config.max_buffer_size;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut buffer = String::new();

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };

                match line {
                    Err(e) => {
                        let _ = err_tx.send(SdkError::io("receive", e)).await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        buffer.push_str(trimmed);

                        // A JSON object may span several lines; keep
                        // accumulating until the buffer parses whole.
                        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(
                            &buffer,
                        ) {
                            Ok(data) => {
                                let msg_type = data
                                    .get("type")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string();
                                let raw = RawMessage {
                                    msg_type,
                                    data,
                                    raw: buffer.clone().into_bytes(),
                                };
                                buffer.clear();
                                // Blocking send: losing a message is never
                                // acceptable, ordering carries correlation.
                                if msg_tx.send(raw).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) if buffer.len() > max_buffer_size => {
                                warn!(bytes = buffer.len(), "JSON buffer overflow");
                                let _ = err_tx
                                    .send(SdkError::with_details(
                                        "receive",
                                        ErrorKind::BufferOverflow,
                                        format!("{} bytes", buffer.len()),
                                    ))
                                    .await;
                                buffer.clear();
                            }
                            Err(_) => {} // incomplete; wait for the next line
                        }
                    }
                }
            }
        });
    }

    fn spawn_stderr_collector(&self, stderr: tokio::process::ChildStderr) {
        let buf = Arc::clone(&self.stderr_buf);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(mut b) = buf.lock() {
                    b.push_str(&line);
                    b.push('\n');
                }
            }
        });
    }

    fn spawn_exit_waiter(
        &self,
        mut child: tokio::process::Child,
        err_tx: mpsc::Sender<SdkError>,
    ) {
        let cancel = self.cancel.child_token();
        let connected = Arc::clone(&self.connected);
        let status_slot = Arc::clone(&self.status);
        let stderr_buf = Arc::clone(&self.stderr_buf);

        tokio::spawn(async move {
            let deliberate = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    true
                }
                _ = child.wait() => false,
            };
            let status = child.wait().await;

            connected.store(false, Ordering::SeqCst);

            let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();
            match status {
                Ok(exit) => {
                    let code = exit.code();
                    debug!(?code, "CLI process exited");
                    if let Ok(mut slot) = status_slot.lock() {
                        *slot = Some(ProcessStatus {
                            exit_code: code,
                            stderr: stderr.clone(),
                        });
                    }
                    if !deliberate && !exit.success() {
                        let mut err = match code {
                            Some(code) => SdkError::from_exit_code("wait", code)
                                .unwrap_or_else(|| SdkError::new("wait", ErrorKind::ProcessExited)),
                            None => SdkError::new("wait", ErrorKind::ProcessExited),
                        };
                        if !stderr.is_empty() {
                            err = err.detail(stderr);
                        }
                        let _ = err_tx.send(err).await;
                    }
                }
                Err(e) => {
                    if let Ok(mut slot) = status_slot.lock() {
                        *slot = Some(ProcessStatus {
                            exit_code: None,
                            stderr,
                        });
                    }
                    let _ = err_tx.send(SdkError::io("wait", e)).await;
                }
            }
            // Dropping the last err_tx clone closes the error channel.
        });
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SdkError::new("connect", ErrorKind::NotConnected));
        }
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.cli_path);
        cmd.args(Self::build_args(&self.config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The exit waiter owns the child; if its task is ever dropped
            // wholesale, the CLI must not linger.
            .kill_on_drop(true);

        // SDK-identifying environment, overridable by the caller.
        cmd.env("CLAUDE_CODE_ENTRYPOINT", SDK_ENTRYPOINT);
        cmd.env("CLAUDE_AGENT_SDK_VERSION", env!("CARGO_PKG_VERSION"));
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::CliNotFound
            } else {
                ErrorKind::CliConnection
            };
            SdkError::with_details("connect", kind, e.to_string())
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SdkError::with_details("connect", ErrorKind::CliConnection, "stdout not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SdkError::with_details("connect", ErrorKind::CliConnection, "stderr not captured")
        })?;
        *self.stdin.lock().await = child.stdin.take();

        let msg_tx = self
            .msg_tx
            .lock()
            .expect("msg_tx lock")
            .take()
            .ok_or_else(|| {
                SdkError::with_details("connect", ErrorKind::CliConnection, "already connected")
            })?;
        let err_tx = self
            .err_tx
            .lock()
            .expect("err_tx lock")
            .take()
            .expect("error sender present on first connect");

        self.connected.store(true, Ordering::SeqCst);

        self.spawn_framer(stdout, msg_tx, err_tx.clone());
        self.spawn_stderr_collector(stderr);
        self.spawn_exit_waiter(child, err_tx);

        debug!(cli = %self.config.cli_path, streaming = self.config.streaming_mode, "connected");
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(SdkError::new("write", ErrorKind::NotConnected));
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SdkError::new("write", ErrorKind::NotConnected))?;

        stdin
            .write_all(data)
            .await
            .map_err(|e| SdkError::io("write", e))?;
        if data.last() != Some(&b'\n') {
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| SdkError::io("write", e))?;
        }
        stdin.flush().await.map_err(|e| SdkError::io("write", e))
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<RawMessage>> {
        self.msg_rx.lock().expect("msg_rx lock").take()
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<SdkError>> {
        self.err_rx.lock().expect("err_rx lock").take()
    }

    async fn end_input(&self) -> Result<()> {
        // Dropping stdin delivers EOF to the child.
        self.stdin.lock().await.take();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.stdin.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn process_status(&self) -> Option<ProcessStatus> {
        self.status.lock().expect("status lock").clone()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Write an executable fake CLI script. The script receives the fixed
    /// `--output-format ...` flags as positional args and ignores them.
    fn fake_cli(body: &str) -> (tempfile::TempDir, Config) {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (
            dir,
            Config {
                cli_path: path.to_string_lossy().into_owned(),
                ..Config::default()
            },
        )
    }

    async fn connect_fake(body: &str) -> (tempfile::TempDir, SubprocessTransport) {
        let (dir, config) = fake_cli(body);
        let transport = SubprocessTransport::new(config);
        transport.connect().await.expect("connect");
        (dir, transport)
    }

    #[test]
    fn build_args_fixed_flags_first() {
        let config = Config {
            streaming_mode: true,
            permission_prompt_tool: Some("mcp__approve".to_string()),
            args: vec!["--model".to_string(), "m1".to_string()],
            ..Config::default()
        };
        let args = SubprocessTransport::build_args(&config);
        assert_eq!(
            &args[..5],
            &[
                "--output-format",
                "stream-json",
                "--verbose",
                "--input-format",
                "stream-json"
            ]
        );
        assert_eq!(&args[5..7], &["--permission-prompt-tool", "mcp__approve"]);
        assert_eq!(&args[7..], &["--model", "m1"]);
    }

    #[test]
    fn build_args_one_shot_has_no_input_format() {
        let args = SubprocessTransport::build_args(&Config::default());
        assert_eq!(args, vec!["--output-format", "stream-json", "--verbose"]);
    }

    #[tokio::test]
    async fn frames_single_line_objects() {
        let (_dir, transport) = connect_fake(
            r#"printf '{"type":"system","subtype":"init","data":{}}\n{"type":"result","subtype":"query_complete"}\n'"#,
        )
        .await;
        let mut messages = transport.take_messages().unwrap();

        let first = messages.recv().await.unwrap();
        assert_eq!(first.msg_type, "system");
        let second = messages.recv().await.unwrap();
        assert_eq!(second.msg_type, "result");
        assert!(messages.recv().await.is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn accumulates_multi_line_objects() {
        // One object split across three lines must come out as exactly one
        // raw message containing the concatenation.
        let body = concat!(
            r#"printf '{"type":"assistant",\n'"#,
            "\n",
            r#"printf '"message":{"role":"assistant","model":"m","content":[]}\n'"#,
            "\n",
            r#"printf '}\n'"#,
        );
        let (_dir, transport) = connect_fake(body).await;
        let mut messages = transport.take_messages().unwrap();

        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.msg_type, "assistant");
        assert!(msg.data.contains_key("message"));
        assert!(messages.recv().await.is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn skips_whitespace_only_lines() {
        let (_dir, transport) = connect_fake(
            "printf '\\n   \\n{\"type\":\"system\",\"subtype\":\"status\",\"data\":{}}\\n'",
        )
        .await;
        let mut messages = transport.take_messages().unwrap();
        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.msg_type, "system");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn buffer_overflow_surfaces_error_and_resumes() {
        // An unterminated object larger than the ceiling overflows; the
        // framer resets and keeps framing subsequent lines.
        let body = concat!(
            r#"printf '{"type":"assistant","pad":"'; head -c 200 /dev/zero | tr '\0' 'x'; printf '\n'"#,
            "\n",
            r#"printf '{"type":"result","subtype":"done"}\n'"#,
        );
        let (_dir, config) = fake_cli(body);
        let transport = SubprocessTransport::new(Config {
            max_buffer_size: 64,
            ..config
        });
        transport.connect().await.unwrap();
        let mut messages = transport.take_messages().unwrap();
        let mut errors = transport.take_errors().unwrap();

        let err = errors.recv().await.unwrap();
        assert_eq!(err.kind, ErrorKind::BufferOverflow);

        let msg = messages.recv().await.unwrap();
        assert_eq!(msg.msg_type, "result");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_reports_process_error_with_stderr() {
        let (_dir, transport) = connect_fake("echo boom >&2; exit 7").await;
        let mut errors = transport.take_errors().unwrap();

        let err = errors.recv().await.unwrap();
        assert_eq!(err.kind, ErrorKind::ExitCode(7));
        assert!(err.details.as_deref().unwrap_or_default().contains("boom"));

        // Channel closes after the final error.
        assert!(errors.recv().await.is_none());

        let status = transport.process_status().unwrap();
        assert_eq!(status.exit_code, Some(7));
        assert!(status.stderr.contains("boom"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn mapped_exit_codes_use_the_taxonomy() {
        let (_dir, transport) = connect_fake("exit 4").await;
        let mut errors = transport.take_errors().unwrap();
        let err = errors.recv().await.unwrap();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.exit_code, Some(4));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_appends_newline_and_child_echoes() {
        // `read` blocks until it sees a full line; without the appended
        // newline the echo below would never happen.
        let (_dir, transport) =
            connect_fake("IFS= read -r line; printf '%s\\n' \"$line\"").await;
        let mut messages = transport.take_messages().unwrap();

        transport.write(br#"{"type":"user"}"#).await.unwrap();
        let echoed = messages.recv().await.unwrap();
        assert_eq!(echoed.msg_type, "user");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_after_close_fails_not_connected() {
        let (_dir, transport) = connect_fake("cat > /dev/null").await;
        transport.close().await.unwrap();
        let err = transport.write(b"{}").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_dir, transport) = connect_fake("cat > /dev/null").await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn end_input_delivers_eof() {
        // `cat` exits once stdin closes; the message channel then closes.
        let (_dir, transport) = connect_fake("cat").await;
        let mut messages = transport.take_messages().unwrap();

        transport.write(br#"{"type":"user"}"#).await.unwrap();
        let echoed = messages.recv().await.unwrap();
        assert_eq!(echoed.msg_type, "user");

        transport.end_input().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await
            .expect("channel should close after EOF");
        assert!(next.is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_maps_to_cli_not_found() {
        let transport = SubprocessTransport::new(Config {
            cli_path: "/nonexistent/claude-cli-for-tests".to_string(),
            ..Config::default()
        });
        let err = transport.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CliNotFound);
    }

    #[tokio::test]
    async fn receivers_are_single_take() {
        let (_dir, config) = fake_cli("true");
        let transport = SubprocessTransport::new(config);
        assert!(transport.take_messages().is_some());
        assert!(transport.take_messages().is_none());
        assert!(transport.take_errors().is_some());
        assert!(transport.take_errors().is_none());
    }
}
