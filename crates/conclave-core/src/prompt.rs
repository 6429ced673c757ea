//! Foundational prompt for an agent turn

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context_sets::{ContextSet, render_for_agent};
use crate::control::ADDRESS_DELIMITER;
use crate::team::{AgentDefinition, AgentKind, Team};

/// A teammate the agent may hand work to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub name: String,
    pub title: String,
    pub role_description: String,
}

/// Everything the router puts in front of an agent, before rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFoundationalPrompt {
    pub agent_name: String,
    pub title: String,
    pub kind: AgentKind,
    pub system_prompt: String,
    pub role_description: String,
    pub directives: Vec<String>,
    pub tools: Vec<String>,
    pub team_name: String,
    pub mission: String,
    pub peers: Vec<PeerSummary>,
    /// Flattened context sets visible to this agent
    pub context: String,
    /// Knowledge-base excerpts retrieved for this turn
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub knowledge: String,
}

impl AgentFoundationalPrompt {
    pub fn build(team: &Team, agent: &AgentDefinition, context_sets: &[ContextSet]) -> Self {
        let peers = team
            .peers_of(&agent.name)
            .filter(|p| !p.disabled && p.accepts_messages_from(Some(&agent.name)))
            .map(|p| PeerSummary {
                name: p.name.clone(),
                title: p.title.clone(),
                role_description: p.role_description.clone(),
            })
            .collect();

        Self {
            agent_name: agent.name.clone(),
            title: agent.title.clone(),
            kind: agent.kind,
            system_prompt: agent.system_prompt.clone(),
            role_description: agent.role_description.clone(),
            directives: agent.prompt_directives.clone(),
            tools: agent.tools.clone(),
            team_name: team.name.clone(),
            mission: team.objectives.clone(),
            peers,
            context: render_for_agent(context_sets, &agent.name),
            knowledge: String::new(),
        }
    }

    pub fn with_knowledge(mut self, knowledge: impl Into<String>) -> Self {
        self.knowledge = knowledge.into();
        self
    }

    pub fn render(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str("# IDENTITY\n\n");
        prompt.push_str(&format!("You are {}", self.agent_name));
        if !self.title.is_empty() {
            prompt.push_str(&format!(", {}", self.title));
        }
        prompt.push_str(&format!(", a member of the team \"{}\".\n", self.team_name));
        if !self.system_prompt.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.system_prompt);
            prompt.push('\n');
        }
        prompt.push('\n');

        if !self.role_description.is_empty() {
            prompt.push_str("# ROLE\n\n");
            prompt.push_str(&self.role_description);
            prompt.push_str("\n\n");
        }

        if !self.directives.is_empty() {
            prompt.push_str("# DIRECTIVES\n\n");
            for directive in &self.directives {
                prompt.push_str(&format!("- {}\n", directive));
            }
            prompt.push('\n');
        }

        if !self.tools.is_empty() {
            prompt.push_str("# TOOLS\n\n");
            prompt.push_str(&self.tools.join(", "));
            prompt.push_str("\n\n");
        }

        if !self.mission.is_empty() {
            prompt.push_str("# MISSION\n\n");
            prompt.push_str(&self.mission);
            prompt.push_str("\n\n");
        }

        if !self.peers.is_empty() {
            prompt.push_str("# TEAM\n\n");
            for peer in &self.peers {
                prompt.push_str(&format!("- {}", peer.name));
                if !peer.title.is_empty() {
                    prompt.push_str(&format!(" ({})", peer.title));
                }
                if !peer.role_description.is_empty() {
                    prompt.push_str(&format!(": {}", peer.role_description));
                }
                prompt.push('\n');
            }
            prompt.push('\n');
        }

        if !self.context.is_empty() {
            prompt.push_str("# CONTEXT\n\n");
            prompt.push_str(&self.context);
            prompt.push('\n');
        }

        if !self.knowledge.is_empty() {
            prompt.push_str("# KNOWLEDGE\n\n");
            prompt.push_str(&self.knowledge);
            prompt.push_str("\n\n");
        }

        prompt.push_str("# CURRENT TIME\n\n");
        prompt.push_str(&chrono::Utc::now().to_rfc3339());
        prompt.push_str("\n\n");

        prompt.push_str("# INSTRUCTIONS\n\n");
        if self.kind == AgentKind::Tool {
            prompt.push_str("Answer with the result only, no commentary. ");
        }
        if let Some(peer) = self.peers.first() {
            prompt.push_str(&format!(
                "To hand work to a teammate, start your reply with their name followed by \
                 `{delim}` and the message, e.g. `{name}{delim} please review this`. ",
                delim = ADDRESS_DELIMITER,
                name = peer.name,
            ));
            prompt.push_str("Only address one teammate per reply. ");
        }
        prompt.push_str("Otherwise reply directly to the user.\n");

        debug!(
            "Built foundational prompt for '{}' ({} chars)",
            self.agent_name,
            prompt.len()
        );

        prompt
    }
}
