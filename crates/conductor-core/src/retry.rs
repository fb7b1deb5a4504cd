//! Centralized retry and error classification.
//!
//! Both the planner's provider fan-out and the worker-failure path use
//! the same three-way classification: retryable (transient, worth another
//! attempt), quota (fail this provider immediately, move on), fatal.

use std::future::Future;
use std::time::Duration;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry after a backoff.
    Retryable,
    /// Rate/quota exhaustion; do not retry against the same target.
    Quota,
    /// Permanent; retrying will not help.
    Fatal,
}

/// Classify an HTTP response from an LLM provider.
///
/// 503 or an "overloaded" body are transient; 429 and quota/rate bodies
/// fail the provider immediately.
pub fn classify_http(status: u16, body: &str) -> ErrorClass {
    let body_lower = body.to_ascii_lowercase();
    if status == 429 || body_lower.contains("quota") || body_lower.contains("rate limit") {
        return ErrorClass::Quota;
    }
    if status == 503 || status == 529 || body_lower.contains("overloaded") {
        return ErrorClass::Retryable;
    }
    if (500..600).contains(&status) {
        return ErrorClass::Retryable;
    }
    ErrorClass::Fatal
}

/// Classify an error string reported by a worker.
///
/// The worker contract carries a bare string; the uniform policy treats
/// failures as retryable unless the worker marks them fatal or the text
/// indicates an input problem no retry can fix.
pub fn classify_worker_error(error: &str) -> ErrorClass {
    let lower = error.to_ascii_lowercase();
    if lower.starts_with("fatal:")
        || lower.contains("invalid input")
        || lower.contains("validation")
    {
        return ErrorClass::Fatal;
    }
    ErrorClass::Retryable
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// The planner's per-provider policy: one retry-worthy failure gets
    /// up to 2 more attempts, 1s apart.
    pub const PROVIDER: Self = Self {
        max_attempts: 3,
        base_delay: Duration::from_secs(1),
    };

    /// Delay before re-running attempt `attempt` (0-based count of
    /// failures so far): base * 2^attempt, capped at 5 minutes.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(Duration::from_secs(300))
    }
}

/// Backoff before re-enqueueing a failed task, by retry count.
pub fn task_backoff(retry_count: i32) -> Duration {
    let policy = RetryPolicy {
        max_attempts: u32::MAX,
        base_delay: Duration::from_secs(5),
    };
    policy.backoff(retry_count.max(0) as u32)
}

/// Run `op` under `policy`, retrying only [`ErrorClass::Retryable`]
/// failures. The error closure maps the operation error to its class.
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    classify: impl Fn(&E) -> ErrorClass,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts || classify(&err) != ErrorClass::Retryable {
                    return Err(err);
                }
                tokio::time::sleep(policy.backoff(attempt - 1)).await;
            }
        }
    }
}
