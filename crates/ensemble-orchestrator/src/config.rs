use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether resource pools are tuned while the system runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAllocationStrategy {
    /// Pools are only changed by explicit allocate/release calls.
    Static,
    /// A background loop periodically optimizes and rebalances pools.
    #[default]
    Dynamic,
}

/// Tuning knobs for scheduling, selection and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on agents selected for a single task.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Deadline for one agent's execution, in milliseconds.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Retries granted after the first failed attempt. 0 disables retry.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay before a retried task is re-dispatched; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Minimum selection score, 0–1.
    #[serde(default = "default_skill_matching_threshold")]
    pub skill_matching_threshold: f64,
    #[serde(default)]
    pub resource_allocation: ResourceAllocationStrategy,
    /// Finished tasks kept for inspection; older ones are dropped.
    #[serde(default = "default_completed_history_limit")]
    pub completed_history_limit: usize,
    /// Period of the background optimizer under the dynamic strategy.
    #[serde(default = "default_optimization_interval_secs")]
    pub optimization_interval_secs: u64,
}

fn default_max_parallel_agents() -> usize {
    10
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_skill_matching_threshold() -> f64 {
    0.7
}

fn default_completed_history_limit() -> usize {
    1000
}

fn default_optimization_interval_secs() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            task_timeout_ms: default_task_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            skill_matching_threshold: default_skill_matching_threshold(),
            resource_allocation: ResourceAllocationStrategy::default(),
            completed_history_limit: default_completed_history_limit(),
            optimization_interval_secs: default_optimization_interval_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_secs(self.optimization_interval_secs)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.max_parallel_agents == 0 {
            return Err(EnsembleError::Config(
                "max_parallel_agents must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(EnsembleError::Config(
                "task_timeout_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.skill_matching_threshold) {
            return Err(EnsembleError::Config(format!(
                "skill_matching_threshold must be within [0, 1], got {}",
                self.skill_matching_threshold
            )));
        }
        if self.resource_allocation == ResourceAllocationStrategy::Dynamic
            && self.optimization_interval_secs == 0
        {
            return Err(EnsembleError::Config(
                "optimization_interval_secs must be positive with dynamic allocation".to_string(),
            ));
        }
        Ok(())
    }
}
