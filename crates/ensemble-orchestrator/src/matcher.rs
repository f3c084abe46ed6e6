use std::collections::BTreeSet;

/// Decides whether an agent's skill satisfies a required skill.
///
/// The scoring helpers are provided: skills are compared through
/// [`skill_matches`](Self::skill_matches), tools always by exact membership.
pub trait CapabilityMatcher: Send + Sync {
    fn skill_matches(&self, agent_skill: &str, required: &str) -> bool;

    /// Share of required skills covered, 0–1. An empty requirement is a
    /// perfect match.
    ///
    /// Counts agent skills that match any required skill, so an agent with
    /// several variants of one skill can cover the whole set; the ratio is
    /// clamped to 1.
    fn skill_score(&self, agent_skills: &BTreeSet<String>, required: &BTreeSet<String>) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = agent_skills
            .iter()
            .filter(|have| required.iter().any(|want| self.skill_matches(have, want)))
            .count();
        (matched as f64 / required.len() as f64).min(1.0)
    }

    /// Share of required tools the agent has, 0–1. An empty requirement is a
    /// perfect match.
    fn tool_score(&self, agent_tools: &BTreeSet<String>, required: &BTreeSet<String>) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = agent_tools.intersection(required).count();
        matched as f64 / required.len() as f64
    }
}

/// Case-insensitive substring containment in either direction, so
/// `"code-review"` satisfies `"review"` and vice versa.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringMatcher;

impl CapabilityMatcher for SubstringMatcher {
    fn skill_matches(&self, agent_skill: &str, required: &str) -> bool {
        let have = agent_skill.to_lowercase();
        let want = required.to_lowercase();
        have.contains(&want) || want.contains(&have)
    }
}

/// Case-insensitive equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl CapabilityMatcher for ExactMatcher {
    fn skill_matches(&self, agent_skill: &str, required: &str) -> bool {
        agent_skill.eq_ignore_ascii_case(required)
    }
}
