use crate::matcher::{CapabilityMatcher, SubstringMatcher};
use crate::registry::AgentRegistry;
use crate::types::{Agent, Task, TaskRequirements};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Weight of the skill component in [`AgentSelector::score`].
pub const SKILL_WEIGHT: f64 = 0.4;
/// Weight of the tool component.
pub const TOOL_WEIGHT: f64 = 0.3;
/// Weight of the rolling success rate.
pub const PERFORMANCE_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub name: String,
    pub score: f64,
}

/// Scores idle agents against a task and reserves the best ones.
#[derive(Clone)]
pub struct AgentSelector {
    matcher: Arc<dyn CapabilityMatcher>,
    threshold: f64,
    max_agents: usize,
}

impl AgentSelector {
    pub fn new(threshold: f64, max_agents: usize) -> Self {
        Self {
            matcher: Arc::new(SubstringMatcher),
            threshold,
            max_agents,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn CapabilityMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// `0.4·skill + 0.3·tool + 0.3·success_rate`, each component in [0, 1].
    pub fn score(&self, agent: &Agent, requirements: &TaskRequirements) -> f64 {
        let skill = self
            .matcher
            .skill_score(&agent.profile.skills, &requirements.required_skills);
        let tool = self
            .matcher
            .tool_score(&agent.profile.tools, &requirements.required_tools);
        let performance = (agent.performance.success_rate / 100.0).clamp(0.0, 1.0);
        SKILL_WEIGHT * skill + TOOL_WEIGHT * tool + PERFORMANCE_WEIGHT * performance
    }

    /// Candidates at or above the threshold, best first, capped at the
    /// configured maximum. Ties keep the input order.
    pub fn rank(&self, candidates: &[&Agent], requirements: &TaskRequirements) -> Vec<ScoredAgent> {
        let mut scored: Vec<ScoredAgent> = candidates
            .iter()
            .map(|agent| ScoredAgent {
                name: agent.profile.name.clone(),
                score: self.score(agent, requirements),
            })
            .filter(|s| s.score >= self.threshold)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.max_agents);
        scored
    }

    /// Rank the registry's idle agents for `task` and mark the winners busy.
    ///
    /// Fails with [`EnsembleError::NoSuitableAgent`] when nobody qualifies.
    pub fn select(&self, registry: &AgentRegistry, task: &Task) -> EnsembleResult<Vec<ScoredAgent>> {
        let mut ranked = Vec::new();
        let mut idle_count = 0;
        let reserved = registry.reserve_with(task.id, |idle| {
            idle_count = idle.len();
            ranked = self.rank(idle, &task.requirements);
            ranked.iter().map(|s| s.name.clone()).collect()
        });

        if reserved.is_empty() {
            debug!(task_id = %task.id, idle = idle_count, "No agent cleared the selection threshold");
            return Err(EnsembleError::NoSuitableAgent {
                task_id: task.id,
                reason: format!(
                    "0 of {idle_count} idle agent(s) scored >= {:.2}",
                    self.threshold
                ),
            });
        }

        ranked.retain(|s| reserved.contains(&s.name));
        info!(
            task_id = %task.id,
            agents = ?reserved,
            top_score = ranked.first().map(|s| s.score).unwrap_or_default(),
            "Agents selected"
        );
        Ok(ranked)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::matcher::ExactMatcher;
    use crate::types::{AgentOrigin, AgentProfile, AgentStatus};

    fn agent(profile: AgentProfile) -> Agent {
        Agent::new(profile, AgentOrigin::Manual)
    }

    #[test]
    fn test_perfect_score_with_empty_requirements() {
        let selector = AgentSelector::new(0.7, 10);
        let a = agent(AgentProfile::new("a"));
        assert!((selector.score(&a, &TaskRequirements::new()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounds() {
        let selector = AgentSelector::new(0.0, 10);
        let requirements = TaskRequirements::new()
            .with_skills(&["rust", "sql"])
            .with_tools(&["git"]);
        let mut a = agent(
            AgentProfile::new("a")
                .with_skills(&["rust", "rust-async", "sql", "sqlite"])
                .with_tools(&["git", "docker"]),
        );
        let top = selector.score(&a, &requirements);
        assert!((top - 1.0).abs() < 1e-9);

        for _ in 0..100 {
            a.performance.record(false, 1.0);
        }
        let low = selector.score(&a, &requirements);
        assert!((0.0..=1.0).contains(&low));
        assert!(low < top);

        let nobody = agent(AgentProfile::new("b"));
        let s = selector.score(&nobody, &requirements);
        assert!((s - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_rank_filters_sorts_and_caps() {
        let selector = AgentSelector::new(0.7, 2);
        let requirements = TaskRequirements::new().with_skills(&["review"]);
        let reviewer = agent(AgentProfile::new("reviewer").with_skills(&["code-review"]));
        let mut tired = agent(AgentProfile::new("tired").with_skills(&["review"]));
        tired.performance.success_rate = 50.0;
        let also = agent(AgentProfile::new("also").with_skills(&["Review"]));
        let writer = agent(AgentProfile::new("writer").with_skills(&["docs"]));

        let ranked = selector.rank(&[&tired, &reviewer, &writer, &also], &requirements);
        let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["reviewer", "also"]);
    }

    #[test]
    fn test_select_reserves_and_reports_no_suitable_agent() {
        let registry = AgentRegistry::new();
        registry.register(AgentProfile::new("blank"), AgentOrigin::Manual);
        registry.register(
            AgentProfile::new("rustacean").with_skills(&["rust"]),
            AgentOrigin::Manual,
        );
        let selector = AgentSelector::new(0.7, 10);

        let task = Task::new("build", TaskRequirements::new().with_skills(&["rust"]));
        let selected = selector.select(&registry, &task).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "rustacean");
        assert_eq!(registry.get("rustacean").unwrap().status, AgentStatus::Busy);
        assert_eq!(registry.get("blank").unwrap().status, AgentStatus::Idle);

        let other = Task::new("again", TaskRequirements::new().with_skills(&["rust"]));
        let err = selector.select(&registry, &other).unwrap_err();
        match err {
            EnsembleError::NoSuitableAgent { task_id, reason } => {
                assert_eq!(task_id, other.id);
                assert!(reason.contains("0 of 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_custom_matcher() {
        let selector = AgentSelector::new(0.7, 10).with_matcher(Arc::new(ExactMatcher));
        let requirements = TaskRequirements::new().with_skills(&["review"]);
        let a = agent(AgentProfile::new("a").with_skills(&["code-review"]));
        assert!(selector.rank(&[&a], &requirements).is_empty());
    }
}
