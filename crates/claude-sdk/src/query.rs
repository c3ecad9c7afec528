use futures::StreamExt;
use tracing::debug;

use crate::error::Result;
use crate::options::Options;
use crate::protocol::{Message, ResultMessage, Usage};
use crate::retry::{with_retry, RetryConfig};
use crate::stream::{missing_result_error, QueryStream};

// ─── QueryResult ──────────────────────────────────────────────────────────

/// Everything a one-shot query produced.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Assistant and system messages, in arrival order.
    pub messages: Vec<Message>,
    /// The terminal result message.
    pub result: Option<ResultMessage>,
    pub session_id: String,
    pub total_cost_usd: f64,
    pub usage: Usage,
}

// ─── One-shot query ───────────────────────────────────────────────────────

/// Run a single prompt to completion in print mode and collect the turn.
///
/// The prompt rides the argv (`--print -- <prompt>` last); stdin is
/// half-closed immediately. Messages are collected until the terminal
/// result arrives; the stream ending early is a process error.
pub async fn query(prompt: &str, opts: &Options) -> Result<QueryResult> {
    collect(QueryStream::new(prompt, opts)).await
}

/// [`query`] under the retry helper; only retryable failures re-run.
pub async fn query_with_retry(
    prompt: &str,
    opts: &Options,
    retry: &RetryConfig,
) -> Result<QueryResult> {
    with_retry(retry, || query(prompt, opts)).await
}

/// Consume a [`QueryStream`] into a [`QueryResult`].
pub(crate) async fn collect(mut stream: QueryStream) -> Result<QueryResult> {
    let mut result = QueryResult::default();

    while let Some(item) = stream.next().await {
        match item? {
            msg @ (Message::Assistant(_) | Message::System(_)) => result.messages.push(msg),
            Message::Result(r) => {
                result.session_id = r.session_id.clone();
                result.total_cost_usd = r.total_cost_usd;
                result.usage = r.usage.clone();
                result.result = Some(r);
                debug!(session_id = %result.session_id, "one-shot query complete");
                return Ok(result);
            }
            // User echoes, control traffic, and unknown types are not part
            // of a one-shot collection.
            _ => {}
        }
    }

    Err(missing_result_error())
}

/// Per-option flags, with the positional prompt last.
pub(crate) fn build_query_args(prompt: &str, opts: &Options) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(system_prompt) = &opts.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(system_prompt.clone());
    }
    if let Some(append) = &opts.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(append.clone());
    }

    if let Some(model) = &opts.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(fallback) = &opts.fallback_model {
        args.push("--fallback-model".to_string());
        args.push(fallback.clone());
    }

    if let Some(max_turns) = opts.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }
    if let Some(budget) = opts.max_budget_usd {
        args.push("--max-budget-usd".to_string());
        args.push(format!("{budget:.2}"));
    }

    if opts.permission_mode != crate::permission::PermissionMode::Default {
        args.push("--permission-mode".to_string());
        args.push(opts.permission_mode.as_str().to_string());
    }
    if !opts.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(opts.allowed_tools.join(","));
    }
    if !opts.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(opts.disallowed_tools.join(","));
    }

    if let Some(resume) = &opts.resume {
        args.push("--resume".to_string());
        args.push(resume.clone());
    }
    if opts.fork_session {
        args.push("--fork-session".to_string());
    }
    if opts.continue_conversation {
        args.push("--continue".to_string());
    }

    // The positional prompt must come last.
    args.push("--print".to_string());
    args.push("--".to_string());
    args.push(prompt.to_string());

    args
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::permission::PermissionMode;

    fn fake_cli(body: &str) -> (tempfile::TempDir, Options) {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (
            dir,
            Options {
                cli_path: Some(path.to_string_lossy().into_owned()),
                ..Options::default()
            },
        )
    }

    #[tokio::test]
    async fn one_shot_happy_path() {
        let body = concat!(
            r#"printf '{"type":"assistant","message":{"role":"assistant","model":"X","content":[{"type":"text","text":"Hi"}]}}\n'"#,
            "\n",
            r#"printf '{"type":"result","subtype":"query_complete","session_id":"S1","total_cost_usd":0.001,"usage":{"input_tokens":10,"output_tokens":5},"duration_ms":100,"duration_api_ms":50,"num_turns":1,"is_error":false}\n'"#,
        );
        let (_dir, opts) = fake_cli(body);

        let result = query("say hi", &opts).await.unwrap();
        assert_eq!(result.session_id, "S1");
        assert!((result.total_cost_usd - 0.001).abs() < f64::EPSILON);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 5);

        let terminal = result.result.unwrap();
        assert_eq!(terminal.subtype, "query_complete");
        assert_eq!(terminal.num_turns, 1);
        assert!(!terminal.is_error);
    }

    #[tokio::test]
    async fn exit_without_result_is_a_process_error() {
        let body = r#"printf '{"type":"assistant","message":{"role":"assistant","model":"X","content":[]}}\n'"#;
        let (_dir, opts) = fake_cli(body);

        let err = query("say hi", &opts).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProcessExited);
        assert_eq!(err.op, "receive");
    }

    #[tokio::test]
    async fn nonzero_exit_maps_through_the_taxonomy() {
        let (_dir, opts) = fake_cli("exit 4");
        let err = query("say hi", &opts).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn query_with_retry_reruns_retryable_failures() {
        // Exit code 4 maps to a rate limit, which is retryable by kind; a
        // marker file makes the fake CLI succeed on the third run.
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("attempts");
        let body = format!(
            concat!(
                "count=$(cat {marker} 2>/dev/null || echo 0)\n",
                "count=$((count + 1))\n",
                "echo $count > {marker}\n",
                "if [ $count -lt 3 ]; then exit 4; fi\n",
                r#"printf '{{"type":"result","subtype":"done","session_id":"S9","total_cost_usd":0,"usage":{{"input_tokens":1,"output_tokens":1}},"duration_ms":1,"duration_api_ms":1,"num_turns":1,"is_error":false}}\n'"#,
            ),
            marker = marker.display()
        );
        let (_script_dir, opts) = fake_cli(&body);

        let retry = RetryConfig {
            max_retries: 3,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: false,
        };
        let result = query_with_retry("go", &opts, &retry).await.unwrap();
        assert_eq!(result.session_id, "S9");
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "3");
    }

    #[test]
    fn args_encode_options_with_prompt_last() {
        let opts = Options {
            system_prompt: Some("be brief".to_string()),
            model: Some("claude-sonnet-4-5".to_string()),
            fallback_model: Some("claude-haiku-4-5".to_string()),
            max_turns: Some(5),
            max_budget_usd: Some(1.5),
            permission_mode: PermissionMode::AcceptEdits,
            allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
            disallowed_tools: vec!["Bash".to_string()],
            resume: Some("sess-1".to_string()),
            fork_session: true,
            continue_conversation: true,
            ..Options::default()
        };
        let args = build_query_args("do the thing", &opts);

        let expect_pair = |flag: &str, value: &str| {
            let i = args.iter().position(|a| a == flag).unwrap_or_else(|| {
                panic!("missing flag {flag} in {args:?}");
            });
            assert_eq!(args[i + 1], value, "{flag}");
        };
        expect_pair("--system-prompt", "be brief");
        expect_pair("--model", "claude-sonnet-4-5");
        expect_pair("--fallback-model", "claude-haiku-4-5");
        expect_pair("--max-turns", "5");
        expect_pair("--max-budget-usd", "1.50");
        expect_pair("--permission-mode", "acceptEdits");
        expect_pair("--allowedTools", "Read,Grep");
        expect_pair("--disallowedTools", "Bash");
        expect_pair("--resume", "sess-1");
        assert!(args.contains(&"--fork-session".to_string()));
        assert!(args.contains(&"--continue".to_string()));

        // Prompt trails everything, after the `--` separator.
        let n = args.len();
        assert_eq!(&args[n - 3..], &["--print", "--", "do the thing"]);
    }

    #[test]
    fn default_options_produce_only_the_print_suffix() {
        let args = build_query_args("p", &Options::default());
        assert_eq!(args, vec!["--print", "--", "p"]);
    }
}
