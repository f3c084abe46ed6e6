use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters describing the scheduler's work since start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    /// Tasks that failed terminally, after retries.
    pub tasks_failed: u64,
    pub retries: u64,
    pub agent_executions: u64,
    pub agent_failures: u64,
    /// Dispatches that found no agent above the threshold.
    pub selection_failures: u64,
    /// Dispatches whose resource allocation was rejected.
    pub resource_failures: u64,
    pub total_task_duration_ms: u64,
    pub avg_task_duration_ms: f64,
}

/// Collects scheduler metrics behind an async lock.
pub struct SchedulerMonitor {
    metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl SchedulerMonitor {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
        }
    }

    pub async fn record_submitted(&self) {
        self.metrics.write().await.tasks_submitted += 1;
    }

    /// Record a task that reached `completed` after `duration_ms`.
    pub async fn record_completed(&self, duration_ms: u64) {
        let mut m = self.metrics.write().await;
        m.tasks_completed += 1;
        m.total_task_duration_ms += duration_ms;
        m.avg_task_duration_ms = m.total_task_duration_ms as f64 / m.tasks_completed as f64;
    }

    pub async fn record_failed(&self) {
        self.metrics.write().await.tasks_failed += 1;
    }

    pub async fn record_retry(&self) {
        self.metrics.write().await.retries += 1;
    }

    /// Record one dispatch's per-agent results.
    pub async fn record_executions(&self, executions: usize, failures: usize) {
        let mut m = self.metrics.write().await;
        m.agent_executions += executions as u64;
        m.agent_failures += failures as u64;
    }

    pub async fn record_selection_failure(&self) {
        self.metrics.write().await.selection_failures += 1;
    }

    pub async fn record_resource_failure(&self) {
        self.metrics.write().await.resource_failures += 1;
    }

    pub async fn snapshot(&self) -> SchedulerMetrics {
        self.metrics.read().await.clone()
    }

    /// Metrics plus derived rates, for status output.
    pub async fn to_json(&self) -> serde_json::Value {
        let metrics = self.snapshot().await;
        let settled = metrics.tasks_completed + metrics.tasks_failed;
        let success_rate = if settled == 0 {
            0.0
        } else {
            metrics.tasks_completed as f64 / settled as f64 * 100.0
        };
        serde_json::json!({
            "metrics": metrics,
            "task_success_rate": success_rate,
        })
    }
}

impl Default for SchedulerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_metrics() {
        let monitor = SchedulerMonitor::new();
        assert_eq!(monitor.snapshot().await, SchedulerMetrics::default());
    }

    #[tokio::test]
    async fn test_completed_average() {
        let monitor = SchedulerMonitor::new();
        monitor.record_submitted().await;
        monitor.record_submitted().await;
        monitor.record_completed(100).await;
        monitor.record_completed(300).await;

        let m = monitor.snapshot().await;
        assert_eq!(m.tasks_submitted, 2);
        assert_eq!(m.tasks_completed, 2);
        assert_eq!(m.total_task_duration_ms, 400);
        assert!((m.avg_task_duration_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failure_counters() {
        let monitor = SchedulerMonitor::new();
        monitor.record_executions(3, 1).await;
        monitor.record_selection_failure().await;
        monitor.record_resource_failure().await;
        monitor.record_retry().await;
        monitor.record_failed().await;

        let m = monitor.snapshot().await;
        assert_eq!(m.agent_executions, 3);
        assert_eq!(m.agent_failures, 1);
        assert_eq!(m.selection_failures, 1);
        assert_eq!(m.resource_failures, 1);
        assert_eq!(m.retries, 1);
        assert_eq!(m.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = SchedulerMonitor::new();
        monitor.record_completed(10).await;
        monitor.record_failed().await;
        let json = monitor.to_json().await;
        assert_eq!(json["metrics"]["tasks_completed"], 1);
        assert_eq!(json["task_success_rate"], 50.0);
    }
}
