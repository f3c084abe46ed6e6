use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The category of capability a source reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Agents,
    Skills,
    Commands,
    Services,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Agents => write!(f, "agents"),
            CapabilityKind::Skills => write!(f, "skills"),
            CapabilityKind::Commands => write!(f, "commands"),
            CapabilityKind::Services => write!(f, "services"),
        }
    }
}

impl std::str::FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "agents" | "agent" => Ok(CapabilityKind::Agents),
            "skills" | "skill" => Ok(CapabilityKind::Skills),
            "commands" | "command" => Ok(CapabilityKind::Commands),
            "services" | "service" => Ok(CapabilityKind::Services),
            other => Err(format!("unknown capability kind '{other}'")),
        }
    }
}

/// One discovered capability.
///
/// For the `agents` kind, `skills` and `tools` describe the agent's profile;
/// other kinds usually leave them empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Name of the origin that reported the item. Filled in by the cache.
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CapabilityItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            skills: Vec::new(),
            tools: Vec::new(),
            origin: String::new(),
            metadata: serde_json::Value::Null,
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

/// Keep the first item for each name, preserving order.
///
/// Sources of the same kind are concatenated as-is; callers that need unique
/// names run the result through this.
pub fn dedupe_by_name(items: Vec<CapabilityItem>) -> Vec<CapabilityItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.name.clone()))
        .collect()
}
