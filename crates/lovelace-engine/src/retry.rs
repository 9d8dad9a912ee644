//! Bounded retry with per-call timeout for upstream and downstream calls.

use std::future::Future;
use std::time::Duration;

use lovelace_types::error::ConnectorError;

use crate::config::types::ResourcesConfig;
use crate::errors::compute_backoff;

/// How a single remote call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_resources(resources: &ResourcesConfig) -> Self {
        Self {
            max_attempts: resources.max_call_attempts.max(1),
            call_timeout: Duration::from_secs(resources.call_timeout_secs),
            initial_backoff: Duration::from_millis(resources.initial_backoff_ms),
            max_backoff: Duration::from_millis(resources.max_backoff_ms),
        }
    }

    /// Same backoff and timeout, different attempt budget.
    #[must_use]
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn backoff_for(&self, err: &ConnectorError, attempt: u32) -> Duration {
        compute_backoff(err, attempt, self.initial_backoff, self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_resources(&ResourcesConfig::default())
    }
}

/// Run one attempt of `call` under the policy's timeout.
///
/// # Errors
///
/// Returns the call's own error, or a retryable `timeout` error if the
/// deadline elapsed first.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    op: &str,
    call: Fut,
) -> Result<T, ConnectorError>
where
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::timeout(
            "CALL_TIMEOUT",
            format!("{op} did not complete within {}ms", timeout.as_millis()),
        )),
    }
}

/// Retry `call` until it succeeds, fails non-retryably, or the attempt
/// budget is spent.
///
/// # Errors
///
/// Returns the last error observed.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut call: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt = 1u32;
    loop {
        match with_timeout(policy.call_timeout, op, call()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(&err, attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                tracing::warn!(
                    op,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms,
                    category = %err.category,
                    code = %err.code,
                    "Retryable error, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.retryable {
                    tracing::warn!(
                        op,
                        attempt,
                        category = %err.category,
                        code = %err.code,
                        "Max attempts exhausted"
                    );
                }
                return Err(err);
            }
        }
    }
}
