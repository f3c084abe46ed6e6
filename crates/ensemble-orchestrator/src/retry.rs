use crate::types::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Decides whether a failed task goes back to pending, and how long to wait
/// before re-dispatching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 disables retry.
    pub retry_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Cap for the backoff delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            retry_attempts,
            backoff_base_ms,
            ..Default::default()
        }
    }

    /// A failed task is retried while it has run at most `retry_attempts`
    /// times, so the total number of attempts is `retry_attempts + 1`.
    pub fn should_retry(&self, task: &Task) -> bool {
        task.status == TaskStatus::Failed && task.attempts <= self.retry_attempts
    }

    /// Delay before the attempt following `attempts` completed ones.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}
