//! Apply-level retry with exponential backoff
//!
//! Shared by the orchestrator's `ApplyPatch` node and the review pipeline's
//! batch apply so both retry the same way.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Longest single wait, whatever the attempt number.
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Wait after failed attempt `attempt` (zero-based): `2^attempt × base`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }
}

/// Final outcome of a retried operation
#[derive(Debug)]
pub struct Retried<T> {
    /// Last attempt's result
    pub result: Result<T>,
    /// Retries used, not counting the first attempt
    pub retries: u32,
}

/// Run `op` until it returns `Ok` with `succeeded(&value)`, or the policy's
/// retries run out. `op` receives the zero-based attempt number.
pub async fn with_backoff<T, F, Fut, S>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
    succeeded: S,
) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    S: Fn(&T) -> bool,
{
    let mut attempt = 0;
    loop {
        let result = op(attempt).await;
        let ok = matches!(&result, Ok(value) if succeeded(value));
        if ok || attempt >= policy.max_retries {
            return Retried {
                result,
                retries: attempt,
            };
        }

        let delay = policy.delay_for(attempt);
        match &result {
            Err(err) => warn!(op = label, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying after error"),
            Ok(_) => warn!(op = label, attempt, delay_ms = delay.as_millis() as u64, "retrying after unsuccessful result"),
        }
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
