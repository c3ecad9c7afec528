use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ─── Sentinel taxonomy ────────────────────────────────────────────────────

/// Sentinel error categories for every failure the SDK can surface.
///
/// Callers match on the kind to decide how to react; the surrounding
/// [`SdkError`] carries the operation name and retry hints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    // CLI lifecycle
    #[error("claude CLI not found")]
    CliNotFound,
    #[error("CLI connection error")]
    CliConnection,
    #[error("CLI process exited unexpectedly")]
    ProcessExited,
    #[error("CLI exited with code {0}")]
    ExitCode(i32),

    // Protocol
    #[error("JSON decode error")]
    JsonDecode,
    #[error("message parse error")]
    MessageParse,
    #[error("control request timeout")]
    ControlTimeout,
    #[error("JSON buffer overflow")]
    BufferOverflow,
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,

    // Session
    #[error("session not found")]
    SessionNotFound,
    #[error("session ID not ready: waiting for first message from CLI")]
    SessionIdNotReady,

    // API limits
    #[error("rate limit exceeded")]
    RateLimit,
    #[error("token limit exceeded")]
    TokenLimit,
    #[error("context window too long")]
    ContextTooLong,
    #[error("budget exceeded")]
    BudgetExceeded,
    #[error("max turns exceeded")]
    TurnsExceeded,
    #[error("quota exhausted")]
    QuotaExhausted,

    // Authentication
    #[error("authentication failed")]
    Authentication,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("subscription required")]
    SubscriptionRequired,

    // Permission
    #[error("tool use denied")]
    ToolDenied,
    #[error("permission denied")]
    PermissionDenied,
    #[error("blocked by hook")]
    BlockedByHook,

    // Cancellation
    #[error("interrupted")]
    Interrupted,
    #[error("operation canceled")]
    Canceled,

    // Configuration
    #[error("invalid configuration")]
    InvalidConfig,
    #[error("model not found")]
    ModelNotFound,

    // MCP
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("I/O error: {0}")]
    Io(String),
}

impl ErrorKind {
    /// Kinds that are safe to retry without an explicit flag on the error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimit | ErrorKind::ControlTimeout)
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ErrorKind::Authentication | ErrorKind::InvalidApiKey | ErrorKind::SubscriptionRequired
        )
    }

    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::TokenLimit
                | ErrorKind::ContextTooLong
                | ErrorKind::BudgetExceeded
                | ErrorKind::TurnsExceeded
                | ErrorKind::QuotaExhausted
        )
    }

    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            ErrorKind::ToolDenied | ErrorKind::PermissionDenied | ErrorKind::BlockedByHook
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ErrorKind::Interrupted | ErrorKind::Canceled)
    }
}

// ─── SdkError ─────────────────────────────────────────────────────────────

/// A classified SDK failure: the operation that failed, a sentinel cause,
/// and optional details plus retry hints.
#[derive(Debug, Clone)]
pub struct SdkError {
    /// Operation name, e.g. `"connect"`, `"initialize"`, `"send"`.
    pub op: &'static str,
    pub kind: ErrorKind,
    pub details: Option<String>,
    /// CLI exit code, when the failure came from process exit.
    pub exit_code: Option<i32>,
    /// Explicit retryable flag. Kind-level classification applies regardless.
    pub retryable: bool,
    /// Server-provided delay overriding the current backoff for one attempt.
    pub retry_after: Option<Duration>,
}

impl SdkError {
    pub fn new(op: &'static str, kind: ErrorKind) -> Self {
        SdkError {
            op,
            kind,
            details: None,
            exit_code: None,
            retryable: false,
            retry_after: None,
        }
    }

    pub fn with_details(op: &'static str, kind: ErrorKind, details: impl Into<String>) -> Self {
        let mut err = Self::new(op, kind);
        err.details = Some(details.into());
        err
    }

    /// An error explicitly marked retryable, optionally carrying a
    /// server-provided delay for the next attempt.
    pub fn retryable(op: &'static str, kind: ErrorKind, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(op, kind);
        err.retryable = true;
        err.retry_after = retry_after;
        err
    }

    pub fn io(op: &'static str, err: std::io::Error) -> Self {
        Self::new(op, ErrorKind::Io(err.to_string()))
    }

    pub fn detail(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable || self.kind.is_retryable()
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind.is_auth()
    }

    pub fn is_limit_error(&self) -> bool {
        self.kind.is_limit()
    }

    pub fn is_permission_error(&self) -> bool {
        self.kind.is_permission()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Map a CLI exit code onto the taxonomy. `0` maps to `None`; the listed
    /// codes map to their sentinel kinds; anything else becomes an opaque
    /// error quoting the code.
    pub fn from_exit_code(op: &'static str, code: i32) -> Option<SdkError> {
        let kind = match code {
            0 => return None,
            2 => ErrorKind::Authentication,
            3 => ErrorKind::InvalidConfig,
            4 => ErrorKind::RateLimit,
            5 => ErrorKind::BudgetExceeded,
            130 => ErrorKind::Interrupted,
            other => ErrorKind::ExitCode(other),
        };
        let mut err = Self::new(op, kind);
        err.exit_code = Some(code);
        Some(err)
    }
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.kind)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        if let Some(code) = self.exit_code {
            write!(f, " [exit code: {code}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for SdkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SdkError>;

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_details() {
        let err = SdkError::new("connect", ErrorKind::CliNotFound);
        let s = err.to_string();
        assert!(s.contains("connect"));
        assert!(s.contains("claude CLI not found"));
    }

    #[test]
    fn display_with_details() {
        let err = SdkError::with_details("connect", ErrorKind::CliConnection, "timeout after 30s");
        let s = err.to_string();
        assert!(s.contains("CLI connection error"));
        assert!(s.contains("timeout after 30s"));
    }

    #[test]
    fn display_with_exit_code() {
        let err = SdkError::from_exit_code("query", 4).unwrap();
        let s = err.to_string();
        assert!(s.contains("rate limit exceeded"));
        assert!(s.contains("exit code: 4"));
    }

    #[test]
    fn exit_code_mapping_is_total_and_injective() {
        assert!(SdkError::from_exit_code("query", 0).is_none());

        let mapped = [
            (2, ErrorKind::Authentication),
            (3, ErrorKind::InvalidConfig),
            (4, ErrorKind::RateLimit),
            (5, ErrorKind::BudgetExceeded),
            (130, ErrorKind::Interrupted),
        ];
        for (code, kind) in mapped {
            let err = SdkError::from_exit_code("query", code).unwrap();
            assert_eq!(err.kind, kind, "code {code}");
            assert_eq!(err.exit_code, Some(code));
        }

        // Unmapped codes are opaque but quote the code.
        let err = SdkError::from_exit_code("query", 42).unwrap();
        assert_eq!(err.kind, ErrorKind::ExitCode(42));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn retryable_by_kind_or_flag() {
        assert!(SdkError::new("q", ErrorKind::RateLimit).is_retryable());
        assert!(SdkError::new("q", ErrorKind::ControlTimeout).is_retryable());
        assert!(!SdkError::new("q", ErrorKind::Authentication).is_retryable());
        assert!(SdkError::retryable("q", ErrorKind::TokenLimit, None).is_retryable());
    }

    #[test]
    fn retryable_error_carries_retry_after() {
        let err = SdkError::retryable("q", ErrorKind::RateLimit, Some(Duration::from_secs(5)));
        assert!(err.retryable);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(SdkError::new("q", ErrorKind::RateLimit).retry_after(), None);
    }

    #[test]
    fn classification_predicates() {
        assert!(SdkError::new("q", ErrorKind::InvalidApiKey).is_auth_error());
        assert!(SdkError::new("q", ErrorKind::SubscriptionRequired).is_auth_error());
        assert!(!SdkError::new("q", ErrorKind::RateLimit).is_auth_error());

        for kind in [
            ErrorKind::RateLimit,
            ErrorKind::TokenLimit,
            ErrorKind::ContextTooLong,
            ErrorKind::BudgetExceeded,
            ErrorKind::TurnsExceeded,
            ErrorKind::QuotaExhausted,
        ] {
            assert!(SdkError::new("q", kind).is_limit_error());
        }
        assert!(!SdkError::new("q", ErrorKind::Authentication).is_limit_error());

        assert!(SdkError::new("q", ErrorKind::ToolDenied).is_permission_error());
        assert!(SdkError::new("q", ErrorKind::PermissionDenied).is_permission_error());
        assert!(!SdkError::new("q", ErrorKind::RateLimit).is_permission_error());
    }

    #[test]
    fn cancellation_never_retryable() {
        assert!(!SdkError::new("q", ErrorKind::Canceled).is_retryable());
        assert!(!SdkError::new("q", ErrorKind::Interrupted).is_retryable());
    }

    #[test]
    fn source_is_the_kind() {
        let err = SdkError::new("connect", ErrorKind::CliNotFound);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "claude CLI not found");
    }
}
