use chrono::{DateTime, Utc};
use ensemble_resources::ResourceRequest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Decay weight for the rolling performance averages.
pub const EMA_ALPHA: f64 = 0.1;

/// Availability of an agent. Only `Idle` agents are considered for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Inactive,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// How an agent got into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentOrigin {
    /// Registered explicitly; never evicted by discovery sync.
    Manual,
    /// Registered from a discovery source; evicted when no longer reported.
    Discovered,
}

/// Capability profile of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub tools: BTreeSet<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            skills: BTreeSet::new(),
            tools: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.skills = skills.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| (*t).to_string()).collect();
        self
    }
}

/// Rolling performance statistics for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Exponential moving average of outcomes, 0–100. Starts at 100.
    pub success_rate: f64,
    /// Exponential moving average of execution time in milliseconds.
    pub avg_execution_ms: f64,
    pub executions: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            success_rate: 100.0,
            avg_execution_ms: 0.0,
            executions: 0,
            failures: 0,
            last_run: None,
        }
    }
}

impl AgentPerformance {
    /// Fold one execution into the averages.
    pub fn record(&mut self, success: bool, elapsed_ms: f64) {
        let sample = if success { 100.0 } else { 0.0 };
        self.success_rate =
            ((1.0 - EMA_ALPHA) * self.success_rate + EMA_ALPHA * sample).clamp(0.0, 100.0);
        self.avg_execution_ms = if self.executions == 0 {
            elapsed_ms
        } else {
            (1.0 - EMA_ALPHA) * self.avg_execution_ms + EMA_ALPHA * elapsed_ms
        };
        self.executions += 1;
        if !success {
            self.failures += 1;
        }
        self.last_run = Some(Utc::now());
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub profile: AgentProfile,
    pub status: AgentStatus,
    pub current_task: Option<Uuid>,
    pub performance: AgentPerformance,
    pub origin: AgentOrigin,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(profile: AgentProfile, origin: AgentOrigin) -> Self {
        Self {
            profile,
            status: AgentStatus::Idle,
            current_task: None,
            performance: AgentPerformance::default(),
            origin,
            registered_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

fn default_task_priority() -> u32 {
    1
}

/// What a task needs: capabilities, ordering and (optionally) resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Informational; dispatch order follows readiness, not priority.
    #[serde(default = "default_task_priority")]
    pub priority: u32,
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    #[serde(default)]
    pub required_tools: BTreeSet<String>,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Capacity allocated for the task while its agents run.
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
}

impl Default for TaskRequirements {
    fn default() -> Self {
        Self {
            priority: default_task_priority(),
            required_skills: BTreeSet::new(),
            required_tools: BTreeSet::new(),
            dependencies: Vec::new(),
            resources: Vec::new(),
        }
    }
}

impl TaskRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.required_skills = skills.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.required_tools = tools.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceRequest>) -> Self {
        self.resources = resources;
        self
    }
}

/// Lifecycle of a task: `pending → in_progress → completed | failed`, with
/// `failed → pending` when a retry is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one agent's execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Per-agent outcomes of one dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcomes: Vec<AgentOutcome>,
}

impl TaskResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// True when nothing ran or every agent failed.
    pub fn all_failed(&self) -> bool {
        self.succeeded() == 0
    }

    /// First recorded agent error, for summaries.
    pub fn first_error(&self) -> Option<&str> {
        self.outcomes.iter().find_map(|o| o.error.as_deref())
    }
}

/// A unit of work in the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub requirements: TaskRequirements,
    pub status: TaskStatus,
    pub assigned_agents: Vec<String>,
    /// Number of times the task has entered `in_progress`.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    /// Resource allocation held while the task runs.
    pub allocation_id: Option<Uuid>,
}

impl Task {
    pub fn new(description: impl Into<String>, requirements: TaskRequirements) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            requirements,
            status: TaskStatus::Pending,
            assigned_agents: Vec::new(),
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            allocation_id: None,
        }
    }

    pub fn dependencies_met(&self, completed_ids: &HashSet<Uuid>) -> bool {
        self.requirements
            .dependencies
            .iter()
            .all(|dep| completed_ids.contains(dep))
    }

    pub fn is_ready(&self, completed_ids: &HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending && self.dependencies_met(completed_ids)
    }

    pub fn depends_on(&self, id: Uuid) -> bool {
        self.requirements.dependencies.contains(&id)
    }

    /// Wall-clock time between start and settlement.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        u64::try_from((end - start).num_milliseconds()).ok()
    }
}
