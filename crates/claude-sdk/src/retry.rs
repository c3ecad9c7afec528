use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result, SdkError};

// ─── RetryConfig ──────────────────────────────────────────────────────────

/// Exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Add ±25% jitter to each backoff sleep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

// ─── Retry loop ───────────────────────────────────────────────────────────

/// Run `f` with exponential backoff until it succeeds, returns a
/// non-retryable error, or the retry budget is exhausted.
///
/// Only errors classified retryable (rate limit, control timeout, or an
/// explicit [`SdkError::retryable`] flag) are retried. A `retry_after` hint
/// on the error overrides the current backoff for that attempt.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_cancellable(config, &CancellationToken::new(), f).await
}

/// [`with_retry`] with a cancellation token: firing during a backoff sleep
/// aborts the loop with a cancellation error.
pub async fn with_retry_cancellable<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = config.initial_backoff;
    let mut last_err: Option<SdkError> = None;

    for attempt in 0..=config.max_retries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt >= config.max_retries {
                    last_err = Some(err);
                    break;
                }

                if let Some(retry_after) = err.retry_after() {
                    backoff = retry_after;
                }

                let mut wait = backoff;
                if config.jitter {
                    wait = add_jitter(wait, 0.25);
                }
                tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SdkError::with_details(
                            "retry",
                            ErrorKind::Canceled,
                            "canceled during backoff",
                        ));
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                backoff = Duration::from_secs_f64(
                    (backoff.as_secs_f64() * config.backoff_factor)
                        .min(config.max_backoff.as_secs_f64()),
                );
                last_err = Some(err);
            }
        }
    }

    let last = last_err.expect("retry loop exited without an error");
    let mut err = SdkError::with_details(
        "retry",
        last.kind.clone(),
        format!("max retries exceeded: {last}"),
    );
    err.exit_code = last.exit_code;
    Err(err)
}

/// Backoff duration for the given zero-based attempt.
pub fn exponential_backoff(
    attempt: u32,
    initial: Duration,
    max: Duration,
    factor: f64,
) -> Duration {
    let backoff = initial.as_secs_f64() * factor.powi(attempt as i32);
    Duration::from_secs_f64(backoff.min(max.as_secs_f64()))
}

/// Add ±`factor` proportional jitter to a duration.
pub fn add_jitter(d: Duration, factor: f64) -> Duration {
    let spread = d.as_secs_f64() * factor * rand::thread_rng().gen_range(-1.0..1.0);
    Duration::from_secs_f64((d.as_secs_f64() + spread).max(0.0))
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = with_retry(&fast_config(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SdkError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<()> = with_retry(&fast_config(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SdkError::new("q", ErrorKind::Authentication))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Authentication);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = with_retry(&fast_config(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SdkError::new("q", ErrorKind::RateLimit))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_after_overrides_backoff() {
        // Two failures carrying retry_after=10ms under a 1s initial backoff:
        // the total elapsed time must track the hint, not the config.
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: false,
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let start = Instant::now();
        let result = with_retry(&config, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SdkError::retryable(
                        "q",
                        ErrorKind::RateLimit,
                        Some(Duration::from_millis(10)),
                    ))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        let elapsed = start.elapsed();

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let result: Result<()> = with_retry(&fast_config(), || async {
            Err(SdkError::new("q", ErrorKind::RateLimit))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.op, "retry");
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert!(err.details.unwrap().contains("max retries exceeded"));
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff_sleep() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let start = Instant::now();
        let result: Result<()> = with_retry_cancellable(&config, &cancel, || async {
            Err(SdkError::new("q", ErrorKind::RateLimit))
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Canceled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_growth_and_cap() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(exponential_backoff(0, initial, max, 2.0), initial);
        assert_eq!(
            exponential_backoff(3, initial, max, 2.0),
            Duration::from_secs(8)
        );
        assert_eq!(exponential_backoff(10, initial, max, 2.0), max);
    }

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = add_jitter(base, 0.25);
            assert!(jittered >= Duration::from_secs_f64(7.5));
            assert!(jittered <= Duration::from_secs_f64(12.5));
        }
    }
}
