use crate::executor::AgentExecutor;
use crate::registry::AgentRegistry;
use crate::types::{AgentOutcome, Task};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs a task on its selected agents concurrently and settles each agent.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    executor: Arc<dyn AgentExecutor>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        executor: Arc<dyn AgentExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            executor,
            timeout,
        }
    }

    /// Execute `task` on every named agent at once.
    ///
    /// Each execution runs under the per-agent deadline; errors, timeouts and
    /// panics become failed outcomes without affecting siblings. Every
    /// settled agent has its statistics updated and is returned to `idle`.
    /// Outcomes are in the order of `agents`.
    pub async fn run_all(&self, agents: &[String], task: &Task) -> Vec<AgentOutcome> {
        join_all(agents.iter().map(|name| self.run_one(name, task))).await
    }

    async fn run_one(&self, name: &str, task: &Task) -> AgentOutcome {
        let Some(agent) = self.registry.get(name) else {
            warn!(agent = %name, task_id = %task.id, "Selected agent vanished before dispatch");
            return AgentOutcome {
                agent: name.to_string(),
                success: false,
                output: None,
                error: Some(format!("agent '{name}' is no longer registered")),
                duration_ms: 0,
            };
        };

        let start = Instant::now();
        let execution = AssertUnwindSafe(self.executor.execute(&agent, task)).catch_unwind();
        let result = match tokio::time::timeout(self.timeout, execution).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_panic)) => Err(format!("executor panicked for agent '{name}'")),
            Err(_elapsed) => Err(format!(
                "Timeout: agent '{name}' exceeded {}ms",
                self.timeout.as_millis()
            )),
        };
        let elapsed = start.elapsed();

        self.registry
            .record_outcome(name, result.is_ok(), elapsed.as_secs_f64() * 1000.0);
        self.registry.release(name, task.id);

        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(output) => {
                debug!(agent = %name, task_id = %task.id, duration_ms, "Agent finished");
                AgentOutcome {
                    agent: name.to_string(),
                    success: true,
                    output: Some(output),
                    error: None,
                    duration_ms,
                }
            }
            Err(error) => {
                warn!(agent = %name, task_id = %task.id, error = %error, "Agent failed");
                AgentOutcome {
                    agent: name.to_string(),
                    success: false,
                    output: None,
                    error: Some(error),
                    duration_ms,
                }
            }
        }
    }
}
