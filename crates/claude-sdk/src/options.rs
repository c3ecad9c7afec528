use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::mcp::{McpServerConfig, SdkMcpServer};
use crate::permission::{CanUseToolFn, PermissionMode, Rule};
use crate::transport::DEFAULT_MAX_BUFFER_SIZE;

// ─── Hook configuration ───────────────────────────────────────────────────

/// How a configured hook reacts: an in-process callback or a shell command.
#[derive(Clone)]
pub enum HookAction {
    Callback(crate::hooks::Callback),
    Command(String),
}

/// One hook registration: an action, an optional tool-name matcher pattern,
/// and a per-entry timeout.
#[derive(Clone)]
pub struct HookEntry {
    pub action: HookAction,
    /// Tool-name pattern; empty or `None` matches every tool.
    pub matcher: Option<String>,
    pub timeout: Option<Duration>,
}

impl HookEntry {
    pub fn callback(cb: crate::hooks::Callback) -> Self {
        HookEntry {
            action: HookAction::Callback(cb),
            matcher: None,
            timeout: None,
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        HookEntry {
            action: HookAction::Command(command.into()),
            matcher: None,
            timeout: None,
        }
    }

    pub fn with_matcher(mut self, pattern: impl Into<String>) -> Self {
        self.matcher = Some(pattern.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Hook registrations per event.
#[derive(Clone, Default)]
pub struct HookConfig {
    pub pre_tool_use: Vec<HookEntry>,
    pub post_tool_use: Vec<HookEntry>,
    pub user_prompt_submit: Vec<HookEntry>,
    pub stop: Vec<HookEntry>,
    pub subagent_stop: Vec<HookEntry>,
    pub pre_compact: Vec<HookEntry>,
    pub notification: Vec<HookEntry>,
}

// ─── Options ──────────────────────────────────────────────────────────────

/// Per-client configuration. There is no global state; everything the SDK
/// does is driven from here.
#[derive(Clone, Default)]
pub struct Options {
    // CLI process
    /// Path to the CLI executable (default `"claude"`).
    pub cli_path: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment for the subprocess, merged over the SDK defaults.
    pub env: HashMap<String, String>,
    /// Name of the MCP tool the CLI should route permission prompts to.
    pub permission_prompt_tool: Option<String>,
    /// Framer accumulation ceiling; defaults to 10 MiB.
    pub max_buffer_size: Option<usize>,

    // Prompting
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,

    // Model
    pub model: Option<String>,
    pub fallback_model: Option<String>,

    // Limits
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,

    // Permissions
    pub permission_mode: PermissionMode,
    pub permission_rules: Vec<Rule>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Final arbiter for tool use, after rules and before mode defaults.
    pub can_use_tool: Option<CanUseToolFn>,

    // Session controls
    /// Session id to resume.
    pub resume: Option<String>,
    pub fork_session: bool,
    /// Continue the most recent conversation.
    pub continue_conversation: bool,
    pub enable_file_checkpointing: bool,

    // MCP
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub sdk_mcp_servers: Vec<Arc<SdkMcpServer>>,

    // Hooks
    pub hooks: Option<HookConfig>,
}

impl Options {
    pub fn effective_max_buffer_size(&self) -> usize {
        self.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("cli_path", &self.cli_path)
            .field("cwd", &self.cwd)
            .field("model", &self.model)
            .field("fallback_model", &self.fallback_model)
            .field("max_turns", &self.max_turns)
            .field("max_budget_usd", &self.max_budget_usd)
            .field("permission_mode", &self.permission_mode)
            .field("allowed_tools", &self.allowed_tools)
            .field("disallowed_tools", &self.disallowed_tools)
            .field("resume", &self.resume)
            .field("continue_conversation", &self.continue_conversation)
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .field("can_use_tool", &self.can_use_tool.is_some())
            .field("hooks", &self.hooks.is_some())
            .finish_non_exhaustive()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
