//! User-supplied reactions to named protocol events.
//!
//! Hooks run either in-process (an async callback) or out-of-process (a
//! shell command fed a JSON envelope on stdin), each with a bounded
//! timeout. Entries are matched against the tool name and triggered in
//! registration order; the first entry that refuses to continue
//! short-circuits the chain.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::Result;

mod executor;
mod matcher;

pub use executor::Executor;
pub use matcher::Matcher;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Events ───────────────────────────────────────────────────────────────

/// The protocol events hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
    Notification,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PreToolUse => "PreToolUse",
            Event::PostToolUse => "PostToolUse",
            Event::UserPromptSubmit => "UserPromptSubmit",
            Event::Stop => "Stop",
            Event::SubagentStop => "SubagentStop",
            Event::PreCompact => "PreCompact",
            Event::Notification => "Notification",
        }
    }

    pub fn from_name(name: &str) -> Option<Event> {
        match name {
            "PreToolUse" => Some(Event::PreToolUse),
            "PostToolUse" => Some(Event::PostToolUse),
            "UserPromptSubmit" => Some(Event::UserPromptSubmit),
            "Stop" => Some(Event::Stop),
            "SubagentStop" => Some(Event::SubagentStop),
            "PreCompact" => Some(Event::PreCompact),
            "Notification" => Some(Event::Notification),
            _ => None,
        }
    }

    pub const ALL: [Event; 7] = [
        Event::PreToolUse,
        Event::PostToolUse,
        Event::UserPromptSubmit,
        Event::Stop,
        Event::SubagentStop,
        Event::PreCompact,
        Event::Notification,
    ];
}

// ─── Input / Output ───────────────────────────────────────────────────────

/// The payload handed to each triggered hook.
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub session_id: String,
    pub transcript_path: String,
    pub cwd: String,
    pub hook_event_name: String,
    pub tool_name: String,
    pub tool_input: Map<String, Value>,
    /// Set for `PostToolUse`.
    pub tool_output: Map<String, Value>,
}

/// What a hook decided.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    pub should_continue: bool,
    pub stop_reason: Option<String>,
    pub suppress_output: bool,
    /// `"block"` for an explicit block.
    pub decision: Option<String>,
    pub system_message: Option<String>,
    pub reason: Option<String>,
    pub hook_specific_output: Option<SpecificOutput>,
}

impl Output {
    /// The neutral outcome: let the chain continue.
    pub fn proceed() -> Self {
        Output {
            should_continue: true,
            ..Output::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecificOutput {
    pub hook_event_name: Option<String>,
    /// `"allow"`, `"deny"`, or `"ask"`.
    pub permission_decision: Option<String>,
    pub permission_decision_reason: Option<String>,
    pub updated_input: Option<Map<String, Value>>,
    pub additional_context: Option<String>,
}

// ─── Entries ──────────────────────────────────────────────────────────────

pub type Callback = Arc<dyn Fn(Input) -> BoxFuture<'static, Result<Output>> + Send + Sync>;

/// How a hook entry reacts when triggered.
#[derive(Clone)]
pub enum Action {
    Callback(Callback),
    Command(String),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Callback(_) => f.write_str("Callback(..)"),
            Action::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub action: Action,
    pub matcher: Option<Matcher>,
    pub timeout: Duration,
}

impl Entry {
    pub fn callback(cb: Callback) -> Self {
        Entry {
            action: Action::Callback(cb),
            matcher: None,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Entry {
            action: Action::Command(command.into()),
            matcher: None,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_matcher(mut self, pattern: impl Into<String>) -> Self {
        self.matcher = Some(Matcher::new(pattern));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────

/// Registry and trigger loop for hook entries.
pub struct Manager {
    hooks: RwLock<HashMap<Event, Vec<Entry>>>,
    executor: Executor,
}

impl Manager {
    pub fn new() -> Self {
        Manager {
            hooks: RwLock::new(HashMap::new()),
            executor: Executor::new(),
        }
    }

    pub fn register(&self, event: Event, entry: Entry) {
        self.hooks
            .write()
            .expect("hooks lock")
            .entry(event)
            .or_default()
            .push(entry);
    }

    pub fn has_hooks(&self, event: Event) -> bool {
        self.hooks
            .read()
            .expect("hooks lock")
            .get(&event)
            .is_some_and(|entries| !entries.is_empty())
    }

    pub fn clear(&self) {
        self.hooks.write().expect("hooks lock").clear();
    }

    /// Run the matching entries for `event` in registration order. The
    /// first entry whose output refuses to continue ends the chain with
    /// that output; an exhausted chain continues.
    pub async fn trigger(&self, event: Event, mut input: Input) -> Result<Output> {
        let entries = self
            .hooks
            .read()
            .expect("hooks lock")
            .get(&event)
            .cloned()
            .unwrap_or_default();
        if entries.is_empty() {
            return Ok(Output::proceed());
        }

        input.hook_event_name = event.as_str().to_string();

        for entry in entries {
            if let Some(matcher) = &entry.matcher {
                if !matcher.matches(&input.tool_name) {
                    continue;
                }
            }

            let output = match &entry.action {
                Action::Callback(cb) => cb(input.clone()).await?,
                Action::Command(command) => {
                    self.executor.execute(command, &input, entry.timeout).await?
                }
            };

            if !output.should_continue {
                return Ok(output);
            }
        }

        Ok(Output::proceed())
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
