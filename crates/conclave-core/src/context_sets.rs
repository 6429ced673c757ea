//! Context sets - named bundles of reference text shown to agents

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Agents that must not see this set
    #[serde(default)]
    pub hidden_from_agents: Vec<String>,
}

impl ContextSet {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            lines,
            disabled: false,
            hidden_from_agents: Vec::new(),
        }
    }

    pub fn hidden_from(mut self, agents: Vec<String>) -> Self {
        self.hidden_from_agents = agents;
        self
    }

    pub fn is_visible_to(&self, agent_name: &str) -> bool {
        let agent = agent_name.trim().to_lowercase();
        !self.disabled
            && !self
                .hidden_from_agents
                .iter()
                .any(|h| h.trim().to_lowercase() == agent)
    }

    pub fn render(&self) -> String {
        let mut out = format!("## {}\n", self.name);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Concatenate every set `agent_name` may see, in order
pub fn render_for_agent(sets: &[ContextSet], agent_name: &str) -> String {
    let visible: Vec<String> = sets
        .iter()
        .filter(|s| s.is_visible_to(agent_name))
        .map(ContextSet::render)
        .collect();
    debug!(
        "Context for '{}': {} of {} sets visible",
        agent_name,
        visible.len(),
        sets.len()
    );
    visible.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets() -> Vec<ContextSet> {
        let mut disabled = ContextSet::new("Old brief", vec!["stale".to_string()]);
        disabled.disabled = true;
        vec![
            ContextSet::new("Brand", vec!["Tone: warm".to_string(), "No emoji".to_string()]),
            ContextSet::new("Pricing", vec!["Tier A: $10".to_string()])
                .hidden_from(vec!["Scribe".to_string()]),
            disabled,
        ]
    }

    #[test]
    fn test_render_for_agent_filters_hidden_and_disabled() {
        let text = render_for_agent(&sets(), " scribe ");
        assert!(text.contains("## Brand\nTone: warm\nNo emoji\n"));
        assert!(!text.contains("Pricing"));
        assert!(!text.contains("stale"));

        let critic = render_for_agent(&sets(), "Critic");
        assert!(critic.contains("Tier A"));
        assert!(critic.find("Brand").unwrap() < critic.find("Pricing").unwrap());
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_for_agent(&[], "Anyone"), "");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ContextSet::new("a", vec![]);
        let b = ContextSet::new("a", vec![]);
        assert_ne!(a.id, b.id);
    }
}
