use crate::types::{Task, TaskResult, TaskStatus};
use chrono::Utc;
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Pending queue, active set and bounded history of finished tasks.
///
/// Live tasks (pending or in progress) are owned here until they settle.
/// Completed and terminally failed tasks move to a ring buffer; their ids
/// stay known so later submissions can still depend on them.
pub struct TaskQueue {
    live: HashMap<Uuid, Task>,
    /// Pending task ids in queue order.
    pending: VecDeque<Uuid>,
    /// Ids of every task that ever completed. Not pruned with `history`:
    /// a task submitted later may name an evicted task as a dependency, and
    /// only the id is needed to satisfy it.
    completed: HashSet<Uuid>,
    /// Ids of every task ever enqueued, so `submit` can tell an evicted task
    /// from one that never existed.
    known: HashSet<Uuid>,
    /// Full records of finished tasks, capped at `history_limit`.
    history: VecDeque<Task>,
    history_limit: usize,
}

impl TaskQueue {
    pub fn new(history_limit: usize) -> Self {
        Self {
            live: HashMap::new(),
            pending: VecDeque::new(),
            completed: HashSet::new(),
            known: HashSet::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    /// Add a pending task to the back of the queue.
    pub fn enqueue(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.known.insert(id);
        self.pending.push_back(id);
        self.live.insert(id, task);
        id
    }

    /// Whether `id` was ever enqueued.
    pub fn is_known(&self, id: Uuid) -> bool {
        self.known.contains(&id)
    }

    pub fn is_ready(&self, id: Uuid) -> bool {
        self.live
            .get(&id)
            .is_some_and(|t| t.is_ready(&self.completed))
    }

    /// Pending tasks depending on `id` whose dependencies are now all
    /// complete, in queue order.
    pub fn ready_dependents(&self, id: Uuid) -> Vec<Uuid> {
        self.pending
            .iter()
            .filter_map(|pid| self.live.get(pid))
            .filter(|t| t.depends_on(id) && t.is_ready(&self.completed))
            .map(|t| t.id)
            .collect()
    }

    /// Move a pending task to `in_progress`, counting the attempt.
    pub fn start(&mut self, id: Uuid) -> EnsembleResult<&Task> {
        let task = match self.live.get_mut(&id) {
            Some(task) => task,
            None if self.known.contains(&id) => {
                return Err(EnsembleError::InvalidState(format!(
                    "task {id} has already finished"
                )))
            }
            None => return Err(EnsembleError::UnknownTask(id)),
        };
        if task.status != TaskStatus::Pending {
            return Err(EnsembleError::InvalidState(format!(
                "task {id} is {}, not pending",
                task.status
            )));
        }
        if !task.dependencies_met(&self.completed) {
            return Err(EnsembleError::DependenciesNotMet(id));
        }

        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        task.completed_at = None;
        task.error = None;
        task.result = None;
        task.assigned_agents.clear();
        task.attempts += 1;
        self.pending.retain(|pid| *pid != id);
        Ok(task)
    }

    pub fn assign(&mut self, id: Uuid, agents: Vec<String>) {
        if let Some(task) = self.live.get_mut(&id) {
            task.assigned_agents = agents;
        }
    }

    pub fn set_allocation(&mut self, id: Uuid, allocation_id: Option<Uuid>) {
        if let Some(task) = self.live.get_mut(&id) {
            task.allocation_id = allocation_id;
        }
    }

    /// Settle an in-progress task as completed and move it to history.
    pub fn complete(&mut self, id: Uuid, result: TaskResult) -> Option<&Task> {
        let mut task = self.live.remove(&id)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result = Some(result);
        task.allocation_id = None;
        self.completed.insert(id);
        self.push_history(task);
        self.history.back()
    }

    /// Settle an in-progress task as failed. It stays live until the caller
    /// either [`requeue`](Self::requeue)s or [`retire`](Self::retire)s it.
    pub fn fail(&mut self, id: Uuid, error: String, result: Option<TaskResult>) -> Option<&Task> {
        let task = self.live.get_mut(&id)?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some(error);
        task.result = result;
        task.allocation_id = None;
        Some(task)
    }

    /// Return a failed task to the back of the pending queue.
    pub fn requeue(&mut self, id: Uuid) -> bool {
        match self.live.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Failed => {
                task.status = TaskStatus::Pending;
                self.pending.push_back(id);
                true
            }
            _ => false,
        }
    }

    /// Move a failed task to history for good.
    pub fn retire(&mut self, id: Uuid) -> bool {
        match self.live.get(&id) {
            Some(task) if task.status == TaskStatus::Failed => {
                if let Some(task) = self.live.remove(&id) {
                    self.push_history(task);
                }
                true
            }
            _ => false,
        }
    }

    fn push_history(&mut self, task: Task) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(task);
    }

    /// A live task, or a finished one still in history.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.live
            .get(&id)
            .or_else(|| self.history.iter().rev().find(|t| t.id == id))
    }

    pub fn pending_tasks(&self) -> Vec<&Task> {
        self.pending
            .iter()
            .filter_map(|id| self.live.get(id))
            .collect()
    }

    pub fn active_tasks(&self) -> Vec<&Task> {
        let mut active: Vec<&Task> = self
            .live
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();
        active.sort_by_key(|t| t.started_at);
        active
    }

    /// Finished tasks, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Task> {
        self.history.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.live
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }

    /// Tasks ever completed, including those evicted from history.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskRequirements;

    fn task() -> Task {
        Task::new("t", TaskRequirements::new())
    }

    fn task_after(deps: &[Uuid]) -> Task {
        Task::new("t", TaskRequirements::new().with_dependencies(deps.to_vec()))
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::default();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.active_count(), 0);
        assert!(!queue.is_known(Uuid::new_v4()));
    }

    #[test]
    fn test_start_requires_dependencies() {
        let mut queue = TaskQueue::default();
        let a = queue.enqueue(task());
        let b = queue.enqueue(task_after(&[a]));
        assert!(matches!(
            queue.start(b),
            Err(EnsembleError::DependenciesNotMet(id)) if id == b
        ));
        assert!(queue.is_ready(a));
        assert!(!queue.is_ready(b));

        let started = queue.start(a).unwrap();
        assert_eq!(started.status, TaskStatus::InProgress);
        assert_eq!(started.attempts, 1);
        assert!(started.started_at.is_some());
        assert_eq!(queue.pending_count(), 1);
        assert!(matches!(queue.start(a), Err(EnsembleError::InvalidState(_))));

        queue.complete(a, TaskResult::default());
        assert_eq!(queue.completed_count(), 1);
        assert_eq!(queue.ready_dependents(a), vec![b]);
        assert!(queue.start(b).is_ok());
    }

    #[test]
    fn test_ready_dependents_in_queue_order() {
        let mut queue = TaskQueue::default();
        let a = queue.enqueue(task());
        let c = queue.enqueue(task());
        let d1 = queue.enqueue(task_after(&[a]));
        let d2 = queue.enqueue(task_after(&[a, c]));
        let d3 = queue.enqueue(task_after(&[a]));

        queue.start(a).unwrap();
        queue.complete(a, TaskResult::default());
        assert_eq!(queue.ready_dependents(a), vec![d1, d3]);

        queue.start(c).unwrap();
        queue.complete(c, TaskResult::default());
        assert_eq!(queue.ready_dependents(c), vec![d2]);
    }

    #[test]
    fn test_unknown_and_finished_tasks() {
        let mut queue = TaskQueue::default();
        assert!(matches!(
            queue.start(Uuid::new_v4()),
            Err(EnsembleError::UnknownTask(_))
        ));
        let a = queue.enqueue(task());
        queue.start(a).unwrap();
        queue.complete(a, TaskResult::default());
        assert!(matches!(queue.start(a), Err(EnsembleError::InvalidState(_))));
        assert_eq!(queue.get(a).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_fail_then_requeue_or_retire() {
        let mut queue = TaskQueue::default();
        let a = queue.enqueue(task());
        let b = queue.enqueue(task());

        queue.start(a).unwrap();
        queue.fail(a, "boom".into(), None);
        assert_eq!(queue.get(a).unwrap().error.as_deref(), Some("boom"));
        assert!(queue.requeue(a));
        assert_eq!(
            queue.pending_tasks().iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![b, a]
        );

        let restarted = queue.start(a).unwrap();
        assert_eq!(restarted.attempts, 2);
        assert!(restarted.error.is_none());
        queue.fail(a, "boom again".into(), None);
        assert!(queue.retire(a));
        assert!(!queue.requeue(a));

        let finished = queue.get(a).unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert_eq!(queue.completed_count(), 0);
        assert_eq!(queue.history().count(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut queue = TaskQueue::new(3);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = queue.enqueue(task());
            queue.start(id).unwrap();
            queue.complete(id, TaskResult::default());
            ids.push(id);
        }
        assert_eq!(queue.history().count(), 3);
        assert!(queue.get(ids[0]).is_none());
        assert!(queue.get(ids[4]).is_some());
        // Evicted tasks still satisfy dependencies.
        assert_eq!(queue.completed_count(), 5);
        let dependent = queue.enqueue(task_after(&[ids[0]]));
        assert!(queue.is_ready(dependent));
    }
}
