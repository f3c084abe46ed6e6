use crate::types::{Agent, AgentOrigin, AgentProfile, AgentStatus};
use ensemble_core::{EnsembleError, EnsembleResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// In-memory table of agents keyed by name.
///
/// Every mutation takes the write lock for its whole duration, so
/// [`reserve_with`](Self::reserve_with) can pick and mark agents busy without
/// another task seeing them idle in between.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent or update an existing one's capabilities.
    ///
    /// Returns `true` when the name was new. Re-registration keeps status
    /// and statistics; a manual registration also pins a discovered agent so
    /// discovery sync no longer evicts it.
    pub fn register(&self, profile: AgentProfile, origin: AgentOrigin) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(&profile.name) {
            Some(existing) => {
                debug!(agent = %profile.name, "Updating agent profile");
                existing.profile = profile;
                if origin == AgentOrigin::Manual {
                    existing.origin = AgentOrigin::Manual;
                }
                false
            }
            None => {
                info!(
                    agent = %profile.name,
                    skills = profile.skills.len(),
                    tools = profile.tools.len(),
                    origin = ?origin,
                    "Agent registered"
                );
                agents.insert(profile.name.clone(), Agent::new(profile, origin));
                true
            }
        }
    }

    pub fn unregister(&self, name: &str) -> EnsembleResult<Agent> {
        let removed = self
            .agents
            .write()
            .remove(name)
            .ok_or_else(|| EnsembleError::UnknownAgent(name.to_string()))?;
        if let Some(task_id) = removed.current_task {
            warn!(agent = %name, task_id = %task_id, "Unregistered an agent mid-task");
        } else {
            info!(agent = %name, "Agent unregistered");
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<Agent> {
        self.agents.read().get(name).cloned()
    }

    /// All agents ordered by name.
    pub fn list(&self) -> Vec<Agent> {
        self.agents.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Mark an agent `idle`, `error` or `inactive`. `busy` is owned by the
    /// scheduler: it cannot be set here, and busy agents cannot be changed.
    pub fn set_status(&self, name: &str, status: AgentStatus) -> EnsembleResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| EnsembleError::UnknownAgent(name.to_string()))?;
        if status == AgentStatus::Busy {
            return Err(EnsembleError::InvalidState(
                "agents only become busy through task selection".to_string(),
            ));
        }
        if agent.status == AgentStatus::Busy {
            return Err(EnsembleError::InvalidState(format!(
                "agent '{name}' is busy with task {}",
                agent
                    .current_task
                    .map(|id| id.to_string())
                    .unwrap_or_default()
            )));
        }
        agent.status = status;
        debug!(agent = %name, status = %status, "Agent status changed");
        Ok(())
    }

    /// Pick agents from the idle set and mark them busy on `task_id` in one
    /// critical section. `pick` receives idle agents in name order and
    /// returns the names to reserve; unknown or non-idle names are ignored.
    pub fn reserve_with<F>(&self, task_id: Uuid, pick: F) -> Vec<String>
    where
        F: FnOnce(&[&Agent]) -> Vec<String>,
    {
        let mut agents = self.agents.write();
        let chosen = {
            let idle: Vec<&Agent> = agents.values().filter(|a| a.is_idle()).collect();
            pick(&idle)
        };

        let mut reserved = Vec::with_capacity(chosen.len());
        for name in chosen {
            if let Some(agent) = agents.get_mut(&name) {
                if agent.is_idle() {
                    agent.status = AgentStatus::Busy;
                    agent.current_task = Some(task_id);
                    reserved.push(name);
                }
            }
        }
        reserved
    }

    /// Return an agent to `idle` if it is still busy on `task_id`.
    pub fn release(&self, name: &str, task_id: Uuid) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(name) {
            Some(agent) if agent.current_task == Some(task_id) => {
                agent.status = AgentStatus::Idle;
                agent.current_task = None;
                true
            }
            _ => false,
        }
    }

    /// Fold an execution outcome into the agent's rolling statistics.
    pub fn record_outcome(&self, name: &str, success: bool, elapsed_ms: f64) {
        if let Some(agent) = self.agents.write().get_mut(name) {
            agent.performance.record(success, elapsed_ms);
        }
    }

    pub fn busy_count(&self) -> usize {
        self.agents
            .read()
            .values()
            .filter(|a| a.status == AgentStatus::Busy)
            .count()
    }

    /// Names of agents registered by discovery sync.
    pub fn discovered_names(&self) -> Vec<String> {
        self.agents
            .read()
            .values()
            .filter(|a| a.origin == AgentOrigin::Discovered)
            .map(|a| a.profile.name.clone())
            .collect()
    }
}
