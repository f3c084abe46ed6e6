use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::executor::AgentExecutor;
use crate::monitor::SchedulerMonitor;
use crate::registry::AgentRegistry;
use crate::retry::RetryPolicy;
use crate::selector::AgentSelector;
use crate::task_queue::TaskQueue;
use crate::types::{Task, TaskRequirements, TaskResult};
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_resources::ResourcePoolManager;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Copy of the queue's pending and running tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Pending tasks in queue order, including those blocked on dependencies.
    pub queued: Vec<Task>,
    /// Tasks currently `in_progress`, oldest first.
    pub active: Vec<Task>,
    /// Number of tasks ever completed.
    pub completed: usize,
}

/// Dependency-aware task scheduler.
///
/// Submitted tasks wait in a queue until every dependency has completed,
/// then are dispatched in the background: agents are selected and reserved,
/// resources allocated, and the task fans out to every selected agent.
/// Each completion re-scans the queue for dependents that became ready.
/// Failed tasks are retried with exponential backoff until the
/// [`RetryPolicy`] gives up.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: RwLock<TaskQueue>,
    registry: Arc<AgentRegistry>,
    selector: AgentSelector,
    dispatcher: Dispatcher,
    resources: Option<Arc<ResourcePoolManager>>,
    retry: RetryPolicy,
    monitor: Arc<SchedulerMonitor>,
    /// Woken whenever a dispatch finishes.
    settled: Notify,
    in_flight: AtomicUsize,
}

enum RunOutcome {
    Completed(TaskResult),
    Failed {
        error: EnsembleError,
        result: Option<TaskResult>,
    },
}

/// Counts a dispatch as in flight until dropped.
struct InFlight(Arc<SchedulerInner>);

impl InFlight {
    fn enter(inner: &Arc<SchedulerInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.settled.notify_waiters();
    }
}

impl TaskScheduler {
    pub fn new(
        config: &OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        executor: Arc<dyn AgentExecutor>,
        resources: Option<Arc<ResourcePoolManager>>,
    ) -> Self {
        let selector =
            AgentSelector::new(config.skill_matching_threshold, config.max_parallel_agents);
        Self::with_selector(config, registry, executor, resources, selector)
    }

    /// Like [`new`](Self::new) with a custom selector, e.g. one using a
    /// different [`CapabilityMatcher`](crate::matcher::CapabilityMatcher).
    pub fn with_selector(
        config: &OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        executor: Arc<dyn AgentExecutor>,
        resources: Option<Arc<ResourcePoolManager>>,
        selector: AgentSelector,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry.clone(), executor, config.task_timeout());
        Self {
            inner: Arc::new(SchedulerInner {
                queue: RwLock::new(TaskQueue::new(config.completed_history_limit)),
                registry,
                selector,
                dispatcher,
                resources,
                retry: RetryPolicy::new(config.retry_attempts, config.retry_backoff_ms),
                monitor: Arc::new(SchedulerMonitor::new()),
                settled: Notify::new(),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a task. If its dependencies have all completed it is dispatched
    /// in the background before this returns; completion is not awaited.
    ///
    /// Every dependency must name a task already submitted to this
    /// scheduler, otherwise [`EnsembleError::UnknownTask`] is returned and
    /// nothing is queued.
    pub async fn submit(
        &self,
        description: impl Into<String>,
        requirements: TaskRequirements,
    ) -> EnsembleResult<Uuid> {
        let task = Task::new(description, requirements);
        let (task_id, ready) = {
            let mut queue = self.inner.queue.write().await;
            if let Some(unknown) = task
                .requirements
                .dependencies
                .iter()
                .find(|dep| !queue.is_known(**dep))
            {
                return Err(EnsembleError::UnknownTask(*unknown));
            }
            let task_id = queue.enqueue(task);
            (task_id, queue.is_ready(task_id))
        };

        self.inner.monitor.record_submitted().await;
        info!(task_id = %task_id, ready, "Task submitted");
        if ready {
            self.inner.spawn_execute(task_id, Duration::ZERO);
        }
        Ok(task_id)
    }

    /// Run a pending task now and wait for it to settle.
    ///
    /// Fails with [`EnsembleError::DependenciesNotMet`] if a dependency has
    /// not completed, and with the dispatch error if no agent qualified,
    /// resources were refused, or every agent failed. Dependents that
    /// become ready are dispatched in the background either way.
    pub async fn execute(&self, task_id: Uuid) -> EnsembleResult<TaskResult> {
        let guard = InFlight::enter(&self.inner);
        Arc::clone(&self.inner).run(task_id, guard).await
    }

    /// Wait until `task_id` completes or fails for good.
    pub async fn wait_for(&self, task_id: Uuid) -> EnsembleResult<Task> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let queue = self.inner.queue.read().await;
                match queue.get(task_id) {
                    Some(task) if task.status.is_terminal() => return Ok(task.clone()),
                    Some(_) => {}
                    None if queue.is_known(task_id) => {
                        return Err(EnsembleError::InvalidState(format!(
                            "task {task_id} has been dropped from history"
                        )))
                    }
                    None => return Err(EnsembleError::UnknownTask(task_id)),
                }
            }
            notified.await;
        }
    }

    /// Wait until no dispatch or pending retry is in flight. Tasks blocked on
    /// dependencies that will never complete do not keep this waiting.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// A live task or one still in the finished-task history.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.queue.read().await.get(task_id).cloned()
    }

    /// Finished tasks still in history, oldest first.
    pub async fn history(&self) -> Vec<Task> {
        self.inner.queue.read().await.history().cloned().collect()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let queue = self.inner.queue.read().await;
        QueueSnapshot {
            queued: queue.pending_tasks().into_iter().cloned().collect(),
            active: queue.active_tasks().into_iter().cloned().collect(),
            completed: queue.completed_count(),
        }
    }

    pub fn monitor(&self) -> &Arc<SchedulerMonitor> {
        &self.inner.monitor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    /// Dispatches currently running or waiting out a retry backoff.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl SchedulerInner {
    /// Dispatch `task_id` on a background task after `delay`.
    fn spawn_execute(self: &Arc<Self>, task_id: Uuid, delay: Duration) {
        let guard = InFlight::enter(self);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = inner.run(task_id, guard).await {
                debug!(task_id = %task_id, error = %e, "Background dispatch ended with error");
            }
        });
    }

    // Boxed so the completion path can spawn further dispatches.
    fn run(
        self: Arc<Self>,
        task_id: Uuid,
        guard: InFlight,
    ) -> BoxFuture<'static, EnsembleResult<TaskResult>> {
        async move {
            let _guard = guard;
            let task = self.queue.write().await.start(task_id)?.clone();
            info!(task_id = %task_id, attempt = task.attempts, "Dispatching task");

            let outcome = self.run_task(&task).await;
            self.settle(&task, outcome).await
        }
        .boxed()
    }

    async fn run_task(&self, task: &Task) -> RunOutcome {
        let agents: Vec<String> = match self.selector.select(&self.registry, task) {
            Ok(selected) => selected.into_iter().map(|s| s.name).collect(),
            Err(error) => {
                debug!(
                    task_id = %task.id,
                    busy_agents = self.registry.busy_count(),
                    error = %error,
                    "Agent selection failed"
                );
                self.monitor.record_selection_failure().await;
                return RunOutcome::Failed {
                    error,
                    result: None,
                };
            }
        };
        self.queue.write().await.assign(task.id, agents.clone());

        let allocation_id = match self.allocate_for(task) {
            Ok(id) => id,
            Err(error) => {
                for name in &agents {
                    self.registry.release(name, task.id);
                }
                self.monitor.record_resource_failure().await;
                return RunOutcome::Failed {
                    error,
                    result: None,
                };
            }
        };
        if allocation_id.is_some() {
            self.queue.write().await.set_allocation(task.id, allocation_id);
        }

        let outcomes = self.dispatcher.run_all(&agents, task).await;

        if let (Some(id), Some(resources)) = (allocation_id, &self.resources) {
            if !resources.release(id) {
                warn!(task_id = %task.id, allocation_id = %id, "Allocation was reclaimed before the task settled");
            }
        }

        let result = TaskResult { outcomes };
        self.monitor
            .record_executions(result.outcomes.len(), result.failed())
            .await;

        if result.all_failed() {
            let error = EnsembleError::Agent(format!(
                "all {} agent(s) failed: {}",
                result.outcomes.len(),
                result.first_error().unwrap_or("no output")
            ));
            RunOutcome::Failed {
                error,
                result: Some(result),
            }
        } else {
            RunOutcome::Completed(result)
        }
    }

    fn allocate_for(&self, task: &Task) -> EnsembleResult<Option<Uuid>> {
        if task.requirements.resources.is_empty() {
            return Ok(None);
        }
        let Some(resources) = &self.resources else {
            return Err(EnsembleError::Resource(
                "task requests resources but no pool manager is configured".to_string(),
            ));
        };

        let outcome = resources.allocate(&task.id.to_string(), &task.requirements.resources)?;
        if !outcome.success {
            let reasons: Vec<String> = outcome
                .failed_requests
                .iter()
                .map(|f| format!("{}: {}", f.pool, f.reason))
                .collect();
            return Err(EnsembleError::Resource(format!(
                "allocation for task {} rejected ({})",
                task.id,
                reasons.join("; ")
            )));
        }
        Ok(outcome.allocation_id)
    }

    async fn settle(self: &Arc<Self>, task: &Task, outcome: RunOutcome) -> EnsembleResult<TaskResult> {
        match outcome {
            RunOutcome::Completed(result) => {
                let (duration_ms, ready) = {
                    let mut queue = self.queue.write().await;
                    let duration_ms = queue
                        .complete(task.id, result.clone())
                        .and_then(Task::duration_ms)
                        .unwrap_or(0);
                    (duration_ms, queue.ready_dependents(task.id))
                };
                self.monitor.record_completed(duration_ms).await;
                info!(
                    task_id = %task.id,
                    succeeded = result.succeeded(),
                    failed = result.failed(),
                    duration_ms,
                    dependents = ready.len(),
                    "Task completed"
                );
                for id in ready {
                    self.spawn_execute(id, Duration::ZERO);
                }
                Ok(result)
            }
            RunOutcome::Failed { error, result } => {
                let message = error.to_string();
                let retry = {
                    let mut queue = self.queue.write().await;
                    let retry = queue
                        .fail(task.id, message.clone(), result)
                        .is_some_and(|t| self.retry.should_retry(t));
                    if retry {
                        queue.requeue(task.id);
                    } else {
                        queue.retire(task.id);
                    }
                    retry
                };

                if retry {
                    let delay = self.retry.backoff(task.attempts);
                    self.monitor.record_retry().await;
                    warn!(
                        task_id = %task.id,
                        attempt = task.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "Task failed, retrying"
                    );
                    self.spawn_execute(task.id, delay);
                } else {
                    self.monitor.record_failed().await;
                    error!(task_id = %task.id, attempts = task.attempts, error = %message, "Task failed");
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use crate::types::{AgentOrigin, AgentProfile, AgentStatus, TaskStatus};
    use ensemble_resources::{PoolConfig, ResourceRequest, ResourceType};

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn scheduler_with(config: &OrchestratorConfig, executor: SimulatedExecutor) -> TaskScheduler {
        let registry = Arc::new(AgentRegistry::new());
        TaskScheduler::new(config, registry, Arc::new(executor), None)
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_dependency() {
        let scheduler = scheduler_with(&config(), SimulatedExecutor::default());
        let ghost = Uuid::new_v4();
        let err = scheduler
            .submit("t", TaskRequirements::new().with_dependencies(vec![ghost]))
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::UnknownTask(id) if id == ghost));
        assert!(scheduler.snapshot().await.queued.is_empty());
    }

    #[tokio::test]
    async fn test_ready_task_is_dispatched_on_submit() {
        let scheduler = scheduler_with(&config(), SimulatedExecutor::default());
        scheduler
            .registry()
            .register(AgentProfile::new("worker"), AgentOrigin::Manual);

        let id = scheduler.submit("t", TaskRequirements::new()).await.unwrap();
        let task = scheduler.wait_for(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_agents, vec!["worker"]);
        assert_eq!(task.attempts, 1);
        assert!(task.started_at.is_some() && task.completed_at.is_some());

        let agent = scheduler.registry().get("worker").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.performance.executions, 1);
    }

    #[tokio::test]
    async fn test_manual_execute_checks_dependencies() {
        let scheduler = scheduler_with(&config(), SimulatedExecutor::default());
        // No agents yet: the first task fails selection and is retried until
        // the policy gives up.
        let first = scheduler.submit("first", TaskRequirements::new()).await.unwrap();
        let second = scheduler
            .submit("second", TaskRequirements::new().with_dependencies(vec![first]))
            .await
            .unwrap();
        assert!(matches!(
            scheduler.execute(second).await,
            Err(EnsembleError::DependenciesNotMet(id)) if id == second
        ));

        let failed = scheduler.wait_for(first).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 4);
        assert!(failed.error.as_deref().unwrap().contains("No suitable agent"));

        scheduler.wait_idle().await;
        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.queued[0].id, second);
        let metrics = scheduler.monitor().snapshot().await;
        assert_eq!(metrics.selection_failures, 4);
        assert_eq!(metrics.retries, 3);
        assert_eq!(metrics.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_once_an_agent_appears() {
        let cfg = OrchestratorConfig {
            retry_attempts: 1,
            retry_backoff_ms: 50,
            ..Default::default()
        };
        let scheduler = scheduler_with(&cfg, SimulatedExecutor::default());
        let id = scheduler.submit("t", TaskRequirements::new()).await.unwrap();
        // The first attempt fails on an empty registry; register before the
        // backoff elapses.
        while scheduler.monitor().snapshot().await.selection_failures == 0 {
            tokio::task::yield_now().await;
        }
        scheduler
            .registry()
            .register(AgentProfile::new("late"), AgentOrigin::Manual);

        let task = scheduler.wait_for(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn test_partial_failure_completes() {
        let scheduler = scheduler_with(
            &config(),
            SimulatedExecutor::default().failing_for(&["bad"]),
        );
        for name in ["bad", "good"] {
            scheduler
                .registry()
                .register(AgentProfile::new(name), AgentOrigin::Manual);
        }
        let id = scheduler.submit("t", TaskRequirements::new()).await.unwrap();
        let task = scheduler.wait_for(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.unwrap();
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
    }

    #[tokio::test]
    async fn test_resource_rejection_releases_agents() {
        let resources = Arc::new(
            ResourcePoolManager::from_configs(&[PoolConfig::new(
                "cpu",
                ResourceType::Compute,
                10.0,
            )])
            .unwrap(),
        );
        let cfg = OrchestratorConfig {
            retry_attempts: 0,
            ..config()
        };
        let registry = Arc::new(AgentRegistry::new());
        registry.register(AgentProfile::new("worker"), AgentOrigin::Manual);
        let scheduler = TaskScheduler::new(
            &cfg,
            registry.clone(),
            Arc::new(SimulatedExecutor::default()),
            Some(resources.clone()),
        );

        let id = scheduler
            .submit(
                "too big",
                TaskRequirements::new().with_resources(vec![ResourceRequest::new("cpu", 50.0)]),
            )
            .await
            .unwrap();
        let task = scheduler.wait_for(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("rejected"));
        assert_eq!(registry.get("worker").unwrap().status, AgentStatus::Idle);
        assert!(resources.active_allocations().is_empty());
        assert_eq!(scheduler.monitor().snapshot().await.resource_failures, 1);
    }

    #[tokio::test]
    async fn test_allocation_is_released_after_run() {
        let resources = Arc::new(ResourcePoolManager::with_default_pools());
        let registry = Arc::new(AgentRegistry::new());
        registry.register(AgentProfile::new("worker"), AgentOrigin::Manual);
        let scheduler = TaskScheduler::new(
            &config(),
            registry,
            Arc::new(SimulatedExecutor::default()),
            Some(resources.clone()),
        );

        let id = scheduler
            .submit(
                "fits",
                TaskRequirements::new().with_resources(vec![ResourceRequest::new("cpu", 5.0)]),
            )
            .await
            .unwrap();
        let task = scheduler.wait_for(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.allocation_id.is_none());
        assert!(resources.active_allocations().is_empty());
        assert_eq!(resources.pool("cpu").unwrap().allocated, 0.0);
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task() {
        let scheduler = scheduler_with(&config(), SimulatedExecutor::default());
        assert!(matches!(
            scheduler.wait_for(Uuid::new_v4()).await,
            Err(EnsembleError::UnknownTask(_))
        ));
        scheduler.wait_idle().await;
        assert_eq!(scheduler.in_flight(), 0);
    }
}
