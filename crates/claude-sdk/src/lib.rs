//! `claude-sdk` — Rust client for the Claude CLI stream-json protocol.
//!
//! The CLI runs as a child process speaking newline-delimited JSON over
//! stdio. This crate hosts that subprocess, multiplexes a duplex message
//! stream over it, services the callbacks the CLI issues mid-turn
//! (tool-permission decisions, hooks, MCP relay), and exposes both a
//! one-shot query and a streaming session.
//!
//! # Architecture
//!
//! ```text
//! Options
//!     │
//!     ▼
//! SubprocessTransport  ← spawns `claude --output-format stream-json …`,
//!     │                  frames JSONL (multi-line accumulation), collects
//!     │                  stderr, records exit status
//!     ▼
//! ProtocolHandler      ← correlates control requests by id; dispatches
//!     │                  can_use_tool / hook_callback / mcp_message to
//!     │                  registered handlers; forwards everything else
//!     ▼
//! Client / Stream      ← connect → initialize → duplex streaming;
//!                        lock-free session-id cell; send / interrupt /
//!                        rewind_files
//! ```
//!
//! One-shot mode skips the control plane: [`query`] puts the prompt on the
//! argv, half-closes stdin, and collects messages until the terminal
//! result.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use claude_sdk::{query, Options};
//!
//! let result = query("Summarize the README.", &Options::default()).await?;
//! println!("{}", result.result.and_then(|r| r.result).unwrap_or_default());
//! ```
//!
//! Streaming, with a permission callback:
//!
//! ```rust,ignore
//! use claude_sdk::{Client, Options};
//! use claude_sdk::permission::PermissionResult;
//! use std::sync::Arc;
//!
//! let mut opts = Options::default();
//! opts.can_use_tool = Some(Arc::new(|tool, _input, _ctx| {
//!     Box::pin(async move {
//!         Ok(if tool == "Bash" {
//!             PermissionResult::deny("no shell in this app")
//!         } else {
//!             PermissionResult::allow()
//!         })
//!     })
//! }));
//!
//! let client = Client::new(opts);
//! let mut stream = client.connect().await?;
//! stream.send("Clean up the scratch directory.").await?;
//! while let Some(msg) = stream.next_message().await {
//!     if msg.as_result().is_some() {
//!         break;
//!     }
//! }
//! stream.close().await?;
//! ```

pub mod error;
pub mod hooks;
pub mod mcp;
pub mod options;
pub mod permission;
pub mod protocol;
pub mod retry;
pub mod transport;

mod client;
mod query;
mod stream;


pub use client::{Client, Stream};
pub use error::{ErrorKind, Result, SdkError};
pub use options::{HookAction, HookConfig, HookEntry, Options};
pub use protocol::{ContentBlock, Message, ResultMessage, Usage};
pub use query::{query, query_with_retry, QueryResult};
pub use retry::{with_retry, with_retry_cancellable, RetryConfig};
pub use stream::{query_stream, QueryStream};
