//! `ensemble.toml` loading.

use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_discovery::{DiscoveryCache, SourceConfig};
use ensemble_orchestrator::{AgentProfile, Orchestrator, OrchestratorConfig, SimulatedExecutor};
use ensemble_resources::{default_pool_configs, PoolConfig, ResourcePoolManager};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Settings for the built-in simulated executor.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Simulated work per agent execution.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Agents whose executions always fail.
    #[serde(default)]
    pub failing_agents: Vec<String>,
}

fn default_delay_ms() -> u64 {
    100
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            failing_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Resource pools; the built-in set when omitted.
    #[serde(default = "default_pool_configs")]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Agents registered at start-up.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Lease length for resource requests that do not set `ttl_secs`.
    #[serde(default)]
    pub allocation_ttl_secs: Option<u64>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            pools: default_pool_configs(),
            sources: Vec::new(),
            agents: Vec::new(),
            executor: ExecutorConfig::default(),
            allocation_ttl_secs: None,
        }
    }
}

impl EnsembleConfig {
    pub fn parse(text: &str) -> EnsembleResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| EnsembleError::Config(e.to_string()))?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Read and parse a config file. Relative discovery directories are
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> EnsembleResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EnsembleError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        let mut config = Self::parse(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for source in &mut self.sources {
            for dir in source
                .directories
                .iter_mut()
                .chain(source.plugin_directories.iter_mut())
            {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }
    }

    /// Build an orchestrator with the configured pools, sources and agents.
    pub fn build(&self) -> EnsembleResult<Orchestrator> {
        let mut resources = ResourcePoolManager::from_configs(&self.pools)?;
        if let Some(secs) = self.allocation_ttl_secs {
            resources = resources.with_default_ttl(Duration::from_secs(secs));
        }
        let resources = Arc::new(resources);
        let discovery = Arc::new(DiscoveryCache::from_configs(&self.sources)?);
        let failing: Vec<&str> = self
            .executor
            .failing_agents
            .iter()
            .map(String::as_str)
            .collect();
        let executor = SimulatedExecutor::new(Duration::from_millis(self.executor.delay_ms))
            .failing_for(&failing);

        let orchestrator = Orchestrator::with_components(
            self.orchestrator.clone(),
            Arc::new(executor),
            resources,
            discovery,
        )?;
        for profile in &self.agents {
            orchestrator.register_agent(profile.clone());
        }
        Ok(orchestrator)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_orchestrator::ResourceAllocationStrategy;
    use ensemble_resources::ResourceRequest;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EnsembleConfig::parse("").unwrap();
        assert_eq!(config.orchestrator.max_parallel_agents, 10);
        assert_eq!(config.pools.len(), 5);
        assert!(config.agents.is_empty());
        assert_eq!(config.executor.delay_ms, 100);
    }

    #[test]
    fn test_full_config() {
        let config = EnsembleConfig::parse(
            r#"
            [orchestrator]
            max_parallel_agents = 4
            skill_matching_threshold = 0.5
            resource_allocation = "static"

            [[pools]]
            id = "gpu"
            type = "compute"
            total = 8.0
            unit = "cards"

            [[sources]]
            id = "local-agents"
            kind = "agents"
            directories = ["agents"]

            [[agents]]
            name = "coder"
            skills = ["rust", "testing"]
            tools = ["cargo"]

            [executor]
            delay_ms = 0
            failing_agents = ["coder"]
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_parallel_agents, 4);
        assert_eq!(
            config.orchestrator.resource_allocation,
            ResourceAllocationStrategy::Static
        );
        assert_eq!(config.orchestrator.retry_attempts, 3);
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].id, "gpu");
        assert_eq!(config.sources[0].refresh_interval_secs, 300);
        assert!(config.agents[0].skills.contains("rust"));
        assert_eq!(config.executor.failing_agents, vec!["coder"]);
    }

    #[test]
    fn test_invalid_orchestrator_settings() {
        let err = EnsembleConfig::parse("[orchestrator]\nskill_matching_threshold = 1.5\n")
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Config(_)));
        assert!(EnsembleConfig::parse("[orchestrator]\nmax_parallel_agents = \"many\"\n").is_err());
    }

    #[test]
    fn test_load_resolves_relative_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ensemble.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[[sources]]\nid = \"s\"\nkind = \"skills\"\ndirectories = [\"skills\", \"/abs\"]"
        )
        .unwrap();

        let config = EnsembleConfig::load(&path).unwrap();
        assert_eq!(config.sources[0].directories[0], dir.path().join("skills"));
        assert_eq!(config.sources[0].directories[1], Path::new("/abs"));
        assert!(EnsembleConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_allocation_ttl_applies_to_requests_without_one() {
        let config = EnsembleConfig::parse("allocation_ttl_secs = 30\n").unwrap();
        assert_eq!(config.allocation_ttl_secs, Some(30));

        let orchestrator = config.build().unwrap();
        let outcome = orchestrator
            .resources()
            .allocate("task", &[ResourceRequest::new("cpu", 1.0)])
            .unwrap();
        let expires_at = outcome.allocations[0].expires_at;
        assert!(expires_at <= chrono::Utc::now() + chrono::Duration::seconds(30));
        assert!(expires_at > chrono::Utc::now() + chrono::Duration::seconds(20));
    }

    #[test]
    fn test_build_registers_agents() {
        let config = EnsembleConfig::parse(
            "[[agents]]\nname = \"a\"\n\n[[agents]]\nname = \"b\"\nskills = [\"x\"]\n",
        )
        .unwrap();
        let orchestrator = config.build().unwrap();
        assert_eq!(orchestrator.registry().len(), 2);
        assert_eq!(orchestrator.resources().pools().len(), 5);
    }
}
