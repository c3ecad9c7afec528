//! Tool-permission arbitration: mode, rule table, and user callback.

use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::hooks::Matcher;

// ─── Modes and behaviors ──────────────────────────────────────────────────

/// How tool executions are authorized for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PermissionMode {
    #[default]
    Default,
    /// Auto-accept file edit operations.
    AcceptEdits,
    /// Read-only tools allowed; writes denied.
    Plan,
    /// Skip all permission checks.
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Allow,
    Deny,
    Ask,
}

// ─── Rules ────────────────────────────────────────────────────────────────

/// A rule in the permission table: a tool-name pattern plus a behavior and
/// a human-readable description (carried as the deny message).
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: Matcher,
    pub behavior: Behavior,
    pub description: String,
}

impl Rule {
    pub fn new(
        tool_pattern: impl Into<String>,
        behavior: Behavior,
        description: impl Into<String>,
    ) -> Self {
        Rule {
            matcher: Matcher::new(tool_pattern),
            behavior,
            description: description.into(),
        }
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        self.matcher.matches(tool_name)
    }

    pub fn pattern(&self) -> &str {
        self.matcher.pattern()
    }
}

// ─── Callback types ───────────────────────────────────────────────────────

/// Context handed to the permission callback alongside tool name and input.
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionContext {
    pub session_id: String,
    pub permission_suggestions: Vec<PermissionSuggestion>,
    pub blocked_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionSuggestion {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub prompt: String,
}

/// Pass-through permission update emitted back to the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionUpdate {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub prompt: String,
}

/// The verdict for one `(tool, input)` query.
#[derive(Debug, Clone, Default)]
pub struct PermissionResult {
    pub allow: bool,
    pub updated_input: Option<Map<String, Value>>,
    pub updated_permissions: Vec<PermissionUpdate>,
    /// Set on deny.
    pub message: Option<String>,
    /// Ask the CLI to interrupt the turn on deny.
    pub interrupt: bool,
}

impl PermissionResult {
    pub fn allow() -> Self {
        PermissionResult {
            allow: true,
            ..PermissionResult::default()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult {
            allow: false,
            message: Some(message.into()),
            ..PermissionResult::default()
        }
    }
}

pub type CanUseToolFn = Arc<
    dyn Fn(
            String,
            Map<String, Value>,
            ToolPermissionContext,
        ) -> BoxFuture<'static, Result<PermissionResult>>
        + Send
        + Sync,
>;

// ─── Evaluator ────────────────────────────────────────────────────────────

/// Arbitrates each tool-use query:
///
/// 1. `bypassPermissions` allows everything.
/// 2. The first matching `allow`/`deny` rule wins; `ask` defers onward.
/// 3. A registered callback decides.
/// 4. Mode defaults apply: `plan` denies writes; everything else allows,
///    since the CLI still runs its own prompts.
pub struct Evaluator {
    mode: RwLock<PermissionMode>,
    rules: RwLock<Vec<Rule>>,
    callback: RwLock<Option<CanUseToolFn>>,
}

impl Evaluator {
    pub fn new(mode: PermissionMode) -> Self {
        Evaluator {
            mode: RwLock::new(mode),
            rules: RwLock::new(Vec::new()),
            callback: RwLock::new(None),
        }
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.write().expect("mode lock") = mode;
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.read().expect("mode lock")
    }

    pub fn set_callback(&self, callback: CanUseToolFn) {
        *self.callback.write().expect("callback lock") = Some(callback);
    }

    pub fn add_rule(&self, rule: Rule) {
        self.rules.write().expect("rules lock").push(rule);
    }

    pub fn clear_rules(&self) {
        self.rules.write().expect("rules lock").clear();
    }

    pub async fn evaluate(
        &self,
        tool_name: &str,
        input: Map<String, Value>,
        context: ToolPermissionContext,
    ) -> Result<PermissionResult> {
        let mode = self.mode();
        let rules = self.rules.read().expect("rules lock").clone();
        let callback = self.callback.read().expect("callback lock").clone();

        if mode == PermissionMode::BypassPermissions {
            return Ok(PermissionResult::allow());
        }

        for rule in &rules {
            if !rule.matches(tool_name) {
                continue;
            }
            match rule.behavior {
                Behavior::Allow => return Ok(PermissionResult::allow()),
                Behavior::Deny => {
                    debug!(tool = tool_name, rule = rule.pattern(), "denied by rule");
                    return Ok(PermissionResult::deny(format!(
                        "Denied by rule: {}",
                        rule.description
                    )));
                }
                Behavior::Ask => {} // defer to the callback / mode default
            }
        }

        if let Some(callback) = callback {
            return callback(tool_name.to_string(), input, context).await;
        }

        match mode {
            PermissionMode::AcceptEdits if is_edit_tool(tool_name) => {
                Ok(PermissionResult::allow())
            }
            PermissionMode::Plan => {
                if is_read_only_tool(tool_name) {
                    Ok(PermissionResult::allow())
                } else {
                    Ok(PermissionResult::deny(
                        "Plan mode: write operations not allowed",
                    ))
                }
            }
            // The CLI still runs its own permission prompts.
            _ => Ok(PermissionResult::allow()),
        }
    }
}

fn is_edit_tool(tool_name: &str) -> bool {
    matches!(tool_name, "Edit" | "Write" | "NotebookEdit")
}

fn is_read_only_tool(tool_name: &str) -> bool {
    matches!(
        tool_name,
        "Read" | "Glob" | "Grep" | "LSP" | "WebFetch" | "WebSearch"
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────
