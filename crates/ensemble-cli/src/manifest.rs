//! Task manifests: named tasks whose dependencies refer to earlier names.

use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_orchestrator::{Orchestrator, TaskRequirements};
use ensemble_resources::ResourceRequest;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use uuid::Uuid;

fn default_priority() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub tools: BTreeSet<String>,
    /// Names of tasks defined earlier in the manifest.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskManifest {
    #[serde(default)]
    pub tasks: Vec<ManifestTask>,
}

impl TaskManifest {
    pub fn parse(text: &str) -> EnsembleResult<Self> {
        let manifest: Self =
            toml::from_str(text).map_err(|e| EnsembleError::Config(e.to_string()))?;
        manifest.check()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> EnsembleResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EnsembleError::Config(format!("Failed to read manifest '{}': {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Names are unique and every `after` entry names an earlier task.
    fn check(&self) -> EnsembleResult<()> {
        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if let Some(missing) = task.after.iter().find(|dep| !seen.contains(dep.as_str())) {
                return Err(EnsembleError::Config(format!(
                    "task '{}' runs after '{missing}', which is not defined before it",
                    task.name
                )));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(EnsembleError::Config(format!(
                    "task '{}' is defined twice",
                    task.name
                )));
            }
        }
        Ok(())
    }

    /// Submit every task in order. Returns `(name, id)` pairs in manifest order.
    pub async fn submit(&self, orchestrator: &Orchestrator) -> EnsembleResult<Vec<(String, Uuid)>> {
        let mut ids: HashMap<&str, Uuid> = HashMap::new();
        let mut submitted = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let dependencies = task
                .after
                .iter()
                .map(|dep| {
                    ids.get(dep.as_str())
                        .copied()
                        .ok_or_else(|| EnsembleError::Config(format!("unknown task '{dep}'")))
                })
                .collect::<EnsembleResult<Vec<_>>>()?;

            let requirements = TaskRequirements {
                priority: task.priority,
                required_skills: task.skills.clone(),
                required_tools: task.tools.clone(),
                dependencies,
                resources: task.resources.clone(),
            };
            let description = if task.description.is_empty() {
                task.name.clone()
            } else {
                task.description.clone()
            };
            let id = orchestrator.submit(description, requirements).await?;
            ids.insert(task.name.as_str(), id);
            submitted.push((task.name.clone(), id));
        }
        Ok(submitted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_orchestrator::{AgentProfile, OrchestratorConfig, SimulatedExecutor, TaskStatus};
    use std::sync::Arc;

    const PIPELINE: &str = r#"
        [[tasks]]
        name = "design"
        skills = ["architecture"]

        [[tasks]]
        name = "build"
        description = "Implement the design"
        skills = ["rust"]
        after = ["design"]
        resources = [{ pool = "cpu", amount = 25.0 }]

        [[tasks]]
        name = "ship"
        after = ["design", "build"]
    "#;

    #[test]
    fn test_parse_manifest() {
        let manifest = TaskManifest::parse(PIPELINE).unwrap();
        assert_eq!(manifest.tasks.len(), 3);
        assert_eq!(manifest.tasks[1].after, vec!["design"]);
        assert_eq!(manifest.tasks[1].resources[0].amount, 25.0);
        assert_eq!(manifest.tasks[2].priority, 1);
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let err = TaskManifest::parse(
            "[[tasks]]\nname = \"a\"\nafter = [\"b\"]\n\n[[tasks]]\nname = \"b\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not defined before"));
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let err =
            TaskManifest::parse("[[tasks]]\nname = \"a\"\n\n[[tasks]]\nname = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[tokio::test]
    async fn test_submit_resolves_names() {
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(SimulatedExecutor::default()),
        )
        .unwrap();
        orchestrator.register_agent(
            AgentProfile::new("generalist").with_skills(&["architecture", "rust"]),
        );

        let manifest = TaskManifest::parse(PIPELINE).unwrap();
        let submitted = manifest.submit(&orchestrator).await.unwrap();
        let names: Vec<&str> = submitted.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["design", "build", "ship"]);

        let ship = orchestrator.wait_for(submitted[2].1).await.unwrap();
        assert_eq!(ship.status, TaskStatus::Completed);
        assert_eq!(
            ship.requirements.dependencies,
            vec![submitted[0].1, submitted[1].1]
        );
        let build = orchestrator.task(submitted[1].1).await.unwrap();
        assert_eq!(build.description, "Implement the design");
    }
}
