use crate::types::{Agent, Task};
use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::HashSet;
use std::time::Duration;

/// Performs the actual work of one agent on one task.
///
/// The scheduler treats the returned value as opaque output; an error is a
/// failure of this agent only.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, agent: &Agent, task: &Task) -> EnsembleResult<serde_json::Value>;
}

/// Stand-in executor for demos and tests: sleeps, then reports what it did.
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    delay: Duration,
    failing_agents: HashSet<String>,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing_agents: HashSet::new(),
        }
    }

    /// Make every execution by these agents fail.
    pub fn failing_for(mut self, agents: &[&str]) -> Self {
        self.failing_agents
            .extend(agents.iter().map(|a| (*a).to_string()));
        self
    }
}

#[async_trait]
impl AgentExecutor for SimulatedExecutor {
    async fn execute(&self, agent: &Agent, task: &Task) -> EnsembleResult<serde_json::Value> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_agents.contains(agent.name()) {
            return Err(EnsembleError::Agent(format!(
                "simulated failure of '{}' on task {}",
                agent.name(),
                task.id
            )));
        }
        Ok(serde_json::json!({
            "agent": agent.name(),
            "task_id": task.id,
            "summary": format!("{} handled '{}'", agent.name(), task.description),
        }))
    }
}
