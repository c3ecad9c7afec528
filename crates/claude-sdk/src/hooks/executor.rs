use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Result, SdkError};

use super::{Input, Output, SpecificOutput};

// ─── Wire envelopes ───────────────────────────────────────────────────────

/// JSON written to the hook command's stdin.
#[derive(Debug, Serialize)]
struct CommandInput<'a> {
    session_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    transcript_path: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    cwd: &'a str,
    hook_event_name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    tool_name: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    tool_input: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    tool_output: &'a Map<String, Value>,
}

/// JSON a hook command may print on stdout when it exits 0.
#[derive(Debug, Default, Deserialize)]
struct CommandOutput {
    #[serde(default, rename = "continue")]
    should_continue: bool,
    #[serde(default, rename = "stopReason")]
    stop_reason: Option<String>,
    #[serde(default, rename = "suppressOutput")]
    suppress_output: bool,
    #[serde(default)]
    decision: Option<String>,
    #[serde(default, rename = "systemMessage")]
    system_message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, rename = "hookSpecificOutput")]
    hook_specific_output: Option<CommandSpecificOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct CommandSpecificOutput {
    #[serde(default, rename = "hookEventName")]
    hook_event_name: Option<String>,
    #[serde(default, rename = "permissionDecision")]
    permission_decision: Option<String>,
    #[serde(default, rename = "permissionDecisionReason")]
    permission_decision_reason: Option<String>,
    #[serde(default, rename = "updatedInput")]
    updated_input: Option<Map<String, Value>>,
    #[serde(default, rename = "additionalContext")]
    additional_context: Option<String>,
}

// ─── Executor ─────────────────────────────────────────────────────────────

/// Runs command hooks through a shell, feeding the hook input as a JSON
/// envelope on stdin and interpreting the exit code:
///
/// | exit  | meaning                                              |
/// |-------|------------------------------------------------------|
/// | 0     | stdout parsed as JSON output; empty means continue   |
/// | 2     | block, with stderr as the reason                     |
/// | other | non-blocking warning, stderr as the system message   |
pub struct Executor {
    shell: String,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            shell: "sh".to_string(),
        }
    }

    pub async fn execute(
        &self,
        command: &str,
        input: &Input,
        timeout: Duration,
    ) -> Result<Output> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CLAUDE_SESSION_ID", &input.session_id)
            // The in-flight future owns the child; timing out drops it, and
            // the child must not outlive the hook.
            .kill_on_drop(true);
        if !input.cwd.is_empty() {
            cmd.env("CLAUDE_PROJECT_DIR", &input.cwd);
            cmd.current_dir(&input.cwd);
        }

        let mut child = cmd.spawn().map_err(|e| SdkError::io("hook", e))?;

        let envelope = CommandInput {
            session_id: &input.session_id,
            transcript_path: &input.transcript_path,
            cwd: &input.cwd,
            hook_event_name: &input.hook_event_name,
            tool_name: &input.tool_name,
            tool_input: &input.tool_input,
            tool_output: &input.tool_output,
        };
        let stdin_bytes = serde_json::to_vec(&envelope)
            .map_err(|e| SdkError::with_details("hook", ErrorKind::JsonDecode, e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&stdin_bytes)
                .await
                .map_err(|e| SdkError::io("hook", e))?;
            // Dropping stdin delivers EOF so `cat`-style hooks terminate.
        }

        // Deadline exceeded maps to an error ahead of any exit-code
        // interpretation.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| SdkError::io("hook", e))?,
            Err(_) => {
                return Err(SdkError::with_details(
                    "hook",
                    ErrorKind::Canceled,
                    format!("hook command timed out after {timeout:?}"),
                ));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(0) => parse_success_output(&output.stdout),
            Some(2) => {
                debug!(%command, "hook blocked");
                Ok(Output {
                    should_continue: false,
                    decision: Some("block".to_string()),
                    reason: Some(stderr),
                    ..Output::default()
                })
            }
            Some(code) => {
                warn!(%command, code, "hook command failed (non-blocking)");
                Ok(Output {
                    should_continue: true,
                    system_message: Some(stderr),
                    ..Output::default()
                })
            }
            None => Err(SdkError::with_details(
                "hook",
                ErrorKind::Io("hook command terminated by signal".to_string()),
                command.to_string(),
            )),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Exit 0: parse stdout as `CommandOutput`; empty or unparseable output
/// means continue.
fn parse_success_output(stdout: &[u8]) -> Result<Output> {
    let trimmed = String::from_utf8_lossy(stdout);
    let trimmed = trimmed.trim();
    if trimmed.is_empty() {
        return Ok(Output::proceed());
    }

    let parsed: CommandOutput = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(Output::proceed()),
    };

    Ok(Output {
        should_continue: parsed.should_continue,
        stop_reason: parsed.stop_reason,
        suppress_output: parsed.suppress_output,
        decision: parsed.decision,
        system_message: parsed.system_message,
        reason: parsed.reason,
        hook_specific_output: parsed.hook_specific_output.map(|o| SpecificOutput {
            hook_event_name: o.hook_event_name,
            permission_decision: o.permission_decision,
            permission_decision_reason: o.permission_decision_reason,
            updated_input: o.updated_input,
            additional_context: o.additional_context,
        }),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> Input {
        Input {
            session_id: "sess-1".to_string(),
            hook_event_name: "PreToolUse".to_string(),
            tool_name: "Bash".to_string(),
            ..Input::default()
        }
    }

    fn timeout() -> Duration {
        Duration::from_secs(10)
    }

    #[tokio::test]
    async fn exit_zero_with_json_output() {
        let executor = Executor::new();
        let out = executor
            .execute(
                r#"printf '{"continue": true, "systemMessage": "ok"}'"#,
                &input(),
                timeout(),
            )
            .await
            .unwrap();
        assert!(out.should_continue);
        assert_eq!(out.system_message.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn exit_zero_with_empty_output_continues() {
        let executor = Executor::new();
        let out = executor.execute("true", &input(), timeout()).await.unwrap();
        assert!(out.should_continue);
    }

    #[tokio::test]
    async fn exit_zero_with_unparseable_output_continues() {
        let executor = Executor::new();
        let out = executor
            .execute("echo not-json-at-all", &input(), timeout())
            .await
            .unwrap();
        assert!(out.should_continue);
    }

    #[tokio::test]
    async fn exit_two_blocks_with_stderr_reason() {
        let executor = Executor::new();
        let out = executor
            .execute(r#"echo "blocked" >&2; exit 2"#, &input(), timeout())
            .await
            .unwrap();
        assert!(!out.should_continue);
        assert_eq!(out.decision.as_deref(), Some("block"));
        assert_eq!(out.reason.as_deref(), Some("blocked\n"));
    }

    #[tokio::test]
    async fn other_exit_codes_warn_but_continue() {
        let executor = Executor::new();
        let out = executor
            .execute(r#"echo "careful" >&2; exit 1"#, &input(), timeout())
            .await
            .unwrap();
        assert!(out.should_continue);
        assert_eq!(out.system_message.as_deref(), Some("careful\n"));
    }

    #[tokio::test]
    async fn timeout_is_an_error_not_an_exit_code() {
        let executor = Executor::new();
        let err = executor
            .execute("sleep 30", &input(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Canceled);
        assert!(err.details.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn session_id_is_injected_into_environment() {
        let executor = Executor::new();
        let out = executor
            .execute(
                r#"printf '{"continue": false, "reason": "%s"}' "$CLAUDE_SESSION_ID""#,
                &input(),
                timeout(),
            )
            .await
            .unwrap();
        assert!(!out.should_continue);
        assert_eq!(out.reason.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn stdin_envelope_carries_the_hook_input() {
        let executor = Executor::new();
        let out = executor
            .execute(
                r#"grep -q '"hook_event_name":"PreToolUse"' && grep_ok=1; if [ "$grep_ok" = 1 ]; then printf '{"continue": true}'; else echo missing >&2; exit 2; fi"#,
                &input(),
                timeout(),
            )
            .await
            .unwrap();
        assert!(out.should_continue, "stdin envelope missing hook_event_name");
    }

    #[tokio::test]
    async fn parses_hook_specific_output() {
        let executor = Executor::new();
        let out = executor
            .execute(
                r#"printf '{"continue": true, "hookSpecificOutput": {"permissionDecision": "deny", "permissionDecisionReason": "nope"}}'"#,
                &input(),
                timeout(),
            )
            .await
            .unwrap();
        let specific = out.hook_specific_output.unwrap();
        assert_eq!(specific.permission_decision.as_deref(), Some("deny"));
        assert_eq!(specific.permission_decision_reason.as_deref(), Some("nope"));
    }
}
