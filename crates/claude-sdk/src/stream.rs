use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result, SdkError};
use crate::options::Options;
use crate::protocol::{parse_message, Message};
use crate::query::build_query_args;
use crate::transport::{Config, SubprocessTransport, Transport};

// ─── QueryStream ──────────────────────────────────────────────────────────

/// An async stream of [`Message`]s from a one-shot CLI run.
///
/// A background task owns the subprocess transport and forwards parsed
/// messages until the terminal result message or process exit. Dropping
/// the stream closes the receiver, which stops the task on its next send.
///
/// ```rust,ignore
/// use claude_sdk::{query_stream, Message, Options};
/// use futures::StreamExt;
///
/// let mut stream = query_stream("say hello", &Options::default());
/// while let Some(msg) = stream.next().await {
///     if let Message::Result(r) = msg? {
///         println!("{:?}", r.result);
///     }
/// }
/// ```
pub struct QueryStream {
    rx: mpsc::Receiver<Result<Message>>,
}

impl QueryStream {
    pub(crate) fn new(prompt: &str, opts: &Options) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let config = Config {
            cli_path: opts
                .cli_path
                .clone()
                .unwrap_or_else(|| crate::transport::DEFAULT_CLI_PATH.to_string()),
            cwd: opts.cwd.clone(),
            streaming_mode: false,
            permission_prompt_tool: opts.permission_prompt_tool.clone(),
            args: build_query_args(prompt, opts),
            env: opts.env.clone(),
            max_buffer_size: opts.effective_max_buffer_size(),
        };

        tokio::spawn(async move {
            let transport = SubprocessTransport::new(config);
            if let Err(e) = transport.connect().await {
                let _ = tx.send(Err(e)).await;
                return;
            }

            let mut messages = transport
                .take_messages()
                .expect("message stream taken once");
            let mut errors = transport.take_errors().expect("error stream taken once");

            // Prompt rides the argv; half-close stdin right away.
            if let Err(e) = transport.end_input().await {
                let _ = tx.send(Err(e)).await;
                let _ = transport.close().await;
                return;
            }

            let mut got_result = false;
            let mut errors_open = true;
            loop {
                tokio::select! {
                    err = errors.recv(), if errors_open => match err {
                        Some(mut err) => {
                            err.op = "receive";
                            let _ = tx.send(Err(err)).await;
                            break;
                        }
                        None => errors_open = false,
                    },
                    raw = messages.recv() => {
                        let Some(raw) = raw else { break };
                        let item = parse_message(&raw.data);
                        let terminal = matches!(item, Ok(Message::Result(_)));
                        if terminal {
                            got_result = true;
                        }
                        if tx.send(item).await.is_err() {
                            break; // receiver dropped
                        }
                        if terminal {
                            break;
                        }
                    }
                }
            }

            // Process ended without a result: surface the exit waiter's
            // classified error, if it published one.
            if !got_result && errors_open {
                if let Some(mut err) = errors.recv().await {
                    err.op = "receive";
                    let _ = tx.send(Err(err)).await;
                }
            }

            let _ = transport.close().await;
        });

        QueryStream { rx }
    }
}

impl Stream for QueryStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Run a one-shot query in print mode and stream its messages.
///
/// The stream terminates after the terminal result message; a process that
/// dies early yields a classified error as its final item. For a collected
/// form see [`query`](crate::query()).
pub fn query_stream(prompt: &str, opts: &Options) -> QueryStream {
    QueryStream::new(prompt, opts)
}

/// Guard for code that consumes a stream to completion without a result.
pub(crate) fn missing_result_error() -> SdkError {
    SdkError::new("receive", ErrorKind::ProcessExited)
}

// ─── Tests ────────────────────────────────────────────────────────────────
