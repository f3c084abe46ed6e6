use crate::config::{OrchestratorConfig, ResourceAllocationStrategy};
use crate::executor::AgentExecutor;
use crate::monitor::SchedulerMetrics;
use crate::registry::AgentRegistry;
use crate::scheduler::TaskScheduler;
use crate::types::{Agent, AgentOrigin, AgentProfile, AgentStatus, Task, TaskRequirements, TaskResult};
use ensemble_core::EnsembleResult;
use ensemble_discovery::{dedupe_by_name, CapabilityKind, DiscoveryCache, DiscoveryStatus};
use ensemble_resources::{
    AllocationOutcome, OptimizationOptions, OptimizationResult, ResourcePoolManager,
    ResourceRequest, UtilizationSnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Point-in-time view of agents, tasks and scheduler counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub agents: Vec<Agent>,
    pub active_tasks: Vec<Task>,
    pub queued_tasks: Vec<Task>,
    pub completed_tasks: usize,
    pub metrics: SchedulerMetrics,
}

impl SystemStatus {
    pub fn idle_agents(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .count()
    }

    pub fn busy_agents(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Busy)
            .count()
    }
}

/// What [`Orchestrator::sync_discovered_agents`] changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub evicted: Vec<String>,
    /// Reported agents shadowed by a manual registration of the same name.
    pub skipped: Vec<String>,
}

/// Entry point tying the agent registry, task scheduler, resource pools and
/// capability discovery together.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    scheduler: TaskScheduler,
    resources: Arc<ResourcePoolManager>,
    discovery: Arc<DiscoveryCache>,
}

impl Orchestrator {
    /// Create an orchestrator with the default resource pools and no
    /// discovery sources.
    pub fn new(config: OrchestratorConfig, executor: Arc<dyn AgentExecutor>) -> EnsembleResult<Self> {
        Self::with_components(
            config,
            executor,
            Arc::new(ResourcePoolManager::with_default_pools()),
            Arc::new(DiscoveryCache::new()),
        )
    }

    pub fn with_components(
        config: OrchestratorConfig,
        executor: Arc<dyn AgentExecutor>,
        resources: Arc<ResourcePoolManager>,
        discovery: Arc<DiscoveryCache>,
    ) -> EnsembleResult<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::new());
        let scheduler = TaskScheduler::new(
            &config,
            registry.clone(),
            executor,
            Some(resources.clone()),
        );
        info!(
            max_parallel_agents = config.max_parallel_agents,
            threshold = config.skill_matching_threshold,
            pools = resources.pools().len(),
            "Orchestrator initialized"
        );
        Ok(Self {
            config,
            registry,
            scheduler,
            resources,
            discovery,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn resources(&self) -> &Arc<ResourcePoolManager> {
        &self.resources
    }

    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    // --- Agents ---

    /// Register an agent, or update the skills and tools of an existing one.
    /// Returns `true` for a new name.
    pub fn register_agent(&self, profile: AgentProfile) -> bool {
        self.registry.register(profile, AgentOrigin::Manual)
    }

    pub fn unregister_agent(&self, name: &str) -> EnsembleResult<Agent> {
        self.registry.unregister(name)
    }

    pub fn set_agent_status(&self, name: &str, status: AgentStatus) -> EnsembleResult<()> {
        self.registry.set_status(name, status)
    }

    // --- Tasks ---

    pub async fn submit(
        &self,
        description: impl Into<String>,
        requirements: TaskRequirements,
    ) -> EnsembleResult<Uuid> {
        self.scheduler.submit(description, requirements).await
    }

    pub async fn execute(&self, task_id: Uuid) -> EnsembleResult<TaskResult> {
        self.scheduler.execute(task_id).await
    }

    pub async fn wait_for(&self, task_id: Uuid) -> EnsembleResult<Task> {
        self.scheduler.wait_for(task_id).await
    }

    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await
    }

    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.scheduler.task(task_id).await
    }

    // --- Status ---

    pub async fn get_system_status(&self) -> SystemStatus {
        let snapshot = self.scheduler.snapshot().await;
        SystemStatus {
            agents: self.registry.list(),
            active_tasks: snapshot.active,
            queued_tasks: snapshot.queued,
            completed_tasks: snapshot.completed,
            metrics: self.scheduler.monitor().snapshot().await,
        }
    }

    pub fn get_discovery_status(&self) -> DiscoveryStatus {
        self.discovery.status()
    }

    // --- Resources ---

    pub fn allocate_resources(
        &self,
        recipient: &str,
        requests: &[ResourceRequest],
    ) -> EnsembleResult<AllocationOutcome> {
        self.resources.allocate(recipient, requests)
    }

    pub fn release_resources(&self, allocation_id: Uuid) -> bool {
        self.resources.release(allocation_id)
    }

    pub fn get_resource_utilization(&self) -> UtilizationSnapshot {
        self.resources.utilization()
    }

    pub fn optimize_resources(&self, options: &OptimizationOptions) -> OptimizationResult {
        self.resources.optimize(options)
    }

    // --- Discovery ---

    /// Reconcile the registry with the agents reported by discovery.
    ///
    /// Newly reported agents are registered as discovered; known discovered
    /// agents get their profile refreshed. Discovered agents that are no
    /// longer reported are evicted unless they are busy, in which case a
    /// later sync retries. Manually registered agents are left alone.
    pub async fn sync_discovered_agents(&self, force_refresh: bool) -> SyncReport {
        let items = dedupe_by_name(
            self.discovery
                .get_data(CapabilityKind::Agents, force_refresh)
                .await,
        );
        let mut report = SyncReport::default();
        let mut reported = HashSet::new();

        for item in items {
            reported.insert(item.name.clone());
            if self
                .registry
                .get(&item.name)
                .is_some_and(|a| a.origin == AgentOrigin::Manual)
            {
                report.skipped.push(item.name);
                continue;
            }
            let profile = AgentProfile {
                name: item.name.clone(),
                description: item.description,
                skills: item.skills.into_iter().collect(),
                tools: item.tools.into_iter().collect(),
            };
            if self.registry.register(profile, AgentOrigin::Discovered) {
                report.added.push(item.name);
            } else {
                report.updated.push(item.name);
            }
        }

        for name in self.registry.discovered_names() {
            if reported.contains(&name) {
                continue;
            }
            match self.registry.get(&name) {
                Some(agent) if agent.status == AgentStatus::Busy => {
                    debug!(agent = %name, "Keeping busy agent no longer reported by discovery");
                }
                Some(_) => {
                    if self.registry.unregister(&name).is_ok() {
                        report.evicted.push(name);
                    }
                }
                None => {}
            }
        }

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            evicted = report.evicted.len(),
            "Discovered agents synchronized"
        );
        report
    }

    /// Start the periodic resource optimizer (dynamic strategy only) and one
    /// refresh timer per discovery source. Abort the handles to stop them.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        match self.config.resource_allocation {
            ResourceAllocationStrategy::Dynamic => {
                handles.push(
                    Arc::clone(&self.resources)
                        .start_optimization_loop(self.config.optimization_interval()),
                );
            }
            ResourceAllocationStrategy::Static => {
                debug!("Static resource allocation, optimizer loop not started");
            }
        }
        handles.extend(Arc::clone(&self.discovery).start_refresh_loops());
        info!(tasks = handles.len(), "Background tasks started");
        handles
    }
}
