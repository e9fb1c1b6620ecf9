//! Outbound call guard: bounded retry with exponential backoff.
//!
//! Wraps idempotent operations only (GET plus the idempotent POST/DELETE
//! calls in the SmartThings client). Transient failures — connect errors,
//! timeouts, HTTP 5xx — are retried under an explicit [`RetryPolicy`] chosen
//! by the call site; client errors (4xx) are surfaced immediately.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

/// An error from an outbound HTTP call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The remote side answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The request never completed (connect failure, timeout, etc).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// All attempts allowed by the policy failed; carries the last cause.
    #[error("retries exhausted: {0}")]
    Exhausted(#[source] Box<CallError>),
}

impl CallError {
    /// Build a `Status` error from a response, consuming the body for context.
    pub async fn from_response(response: reqwest::Response) -> CallError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        CallError::Status { status, body }
    }

    /// Whether the failure is worth retrying: timeouts, connection failures,
    /// and server-side (5xx) errors. Client errors (4xx) never are.
    fn transient(&self) -> bool {
        match self {
            CallError::Status { status, .. } => status.is_server_error(),
            CallError::Transport(e) => e.is_timeout() || e.is_connect(),
            CallError::Exhausted(_) => false,
        }
    }
}

/// Retry policy for the outbound call guard.
///
/// Call sites pick a policy and pass it in; there is no ambient default
/// hiding inside the guard itself.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// A single attempt, no retries. For calls that must not be repeated.
    pub const fn none() -> Self {
        RetryPolicy::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Backoff before the attempt after `attempt` failures: doubles each
    /// time, capped at `max_backoff`.
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(2))
    }
}

/// Run an idempotent operation under the given retry policy.
///
/// `op` is invoked up to `policy.max_attempts` times. Non-transient errors
/// return immediately; a transient error on the final attempt is wrapped in
/// [`CallError::Exhausted`].
pub async fn call<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, CallError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let mut failures = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.transient() => return Err(e),
            Err(e) => {
                failures += 1;
                if failures >= policy.max_attempts {
                    return Err(CallError::Exhausted(Box::new(e)));
                }
                warn!(attempt = failures, error = %e, "transient failure, retrying");
                tokio::time::sleep(policy.backoff(failures - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn server_error() -> CallError {
        CallError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".into(),
        }
    }

    fn client_error() -> CallError {
        CallError::Status {
            status: StatusCode::BAD_REQUEST,
            body: "nope".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = call(&fast(), || async {
            match attempts.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(server_error()),
                _ => Ok(42),
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        // exactly three attempts, no duplicate call after success
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = call(&fast(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(client_error())
        })
        .await;
        assert!(matches!(
            result,
            Err(CallError::Status { status, .. }) if status == StatusCode::BAD_REQUEST
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_attempts_yields_exhausted_with_last_cause() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = call(&fast(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(server_error())
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(CallError::Exhausted(cause)) => {
                assert!(matches!(
                    *cause,
                    CallError::Status { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR
                ));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_retry_policy_runs_exactly_once() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = call(&RetryPolicy::none(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(server_error())
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(CallError::Exhausted(_))));
    }
}
