//! Bounded retry with linear back-off and cancellation.

use crate::error::{LoomError, LoomResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempt ceiling and base delay. The wait after failed attempt `n` is `n * base_delay`,
/// so delays never decrease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the attempt ceiling
    /// is reached. The error of the last failed attempt is returned. `op` receives the
    /// 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> LoomResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LoomResult<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(LoomError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoomError::Cancelled),
                outcome = op(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(target: "loom::retry", unit = label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        target: "loom::retry",
                        unit = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "attempt failed"
                    );
                    last_error = Some(err);

                    if attempt < self.max_attempts {
                        let delay = self.delay_after(attempt);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(LoomError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LoomError::InvalidRequest("retry policy allowed no attempts".to_string())
        }))
    }
}
