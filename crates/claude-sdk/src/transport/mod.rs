//! Byte-stream transports to the Claude CLI.
//!
//! A [`Transport`] carries JSON-lines in both directions: raw framed
//! messages inbound, one-line JSON objects outbound. The only production
//! implementation is [`SubprocessTransport`], which hosts the CLI as a
//! child process.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

mod subprocess;

pub use subprocess::SubprocessTransport;

pub const DEFAULT_CLI_PATH: &str = "claude";
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Capacity of the inbound raw-message channel. The framer blocks when it
/// is full; a raw message is never dropped, since ordering is load-bearing
/// for control-response correlation.
pub(crate) const RAW_CHANNEL_CAPACITY: usize = 100;

// ─── Config ───────────────────────────────────────────────────────────────

/// Launch configuration for a CLI subprocess.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the CLI executable (default: `"claude"`).
    pub cli_path: String,
    pub cwd: Option<PathBuf>,
    /// Duplex streaming mode: adds `--input-format stream-json`.
    pub streaming_mode: bool,
    pub permission_prompt_tool: Option<String>,
    /// Caller-supplied args appended after the fixed leading flags.
    pub args: Vec<String>,
    /// Extra environment variables, merged over the SDK defaults
    /// (caller wins).
    pub env: HashMap<String, String>,
    /// Ceiling for multi-line JSON accumulation before the framer reports
    /// an overflow (default 10 MiB).
    pub max_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cli_path: DEFAULT_CLI_PATH.to_string(),
            cwd: None,
            streaming_mode: false,
            permission_prompt_tool: None,
            args: Vec::new(),
            env: HashMap::new(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

// ─── Wire envelopes ───────────────────────────────────────────────────────

/// A framed but not yet semantically typed message from the CLI.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The `type` discriminator, empty if absent.
    pub msg_type: String,
    /// The parsed JSON object.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// The original bytes as accumulated by the framer.
    pub raw: Vec<u8>,
}

/// Post-mortem status of an exited CLI process.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Collected stderr scrollback.
    pub stderr: String,
}

// ─── Transport trait ──────────────────────────────────────────────────────

/// A duplex JSON-lines connection to the CLI.
///
/// The inbound message and error streams are single-consumer: each can be
/// taken exactly once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (spawn the child, start the workers).
    async fn connect(&self) -> Result<()>;

    /// Write one JSON object to the peer. A trailing newline is appended
    /// if missing. Concurrent writes never interleave.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Take the inbound raw-message stream. Returns `None` after the first
    /// call.
    fn take_messages(&self) -> Option<mpsc::Receiver<RawMessage>>;

    /// Take the inbound error stream. Returns `None` after the first call.
    fn take_errors(&self) -> Option<mpsc::Receiver<crate::error::SdkError>>;

    /// Half-close: signal end of input to the peer.
    async fn end_input(&self) -> Result<()>;

    /// Tear down the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Exit code and stderr scrollback, once the process has exited.
    fn process_status(&self) -> Option<ProcessStatus>;
}
