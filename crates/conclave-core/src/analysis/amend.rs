//! Base-prompt amendment
//!
//! The model reviews the conversation (and any notes taken on it) and may
//! propose a rewritten system prompt for some agents. Proposals are applied one
//! agent at a time to a new team snapshot.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::conversation::ConversationLog;
use crate::llm::{LanguageModel, ObjectRequest, complete_typed};
use crate::providers::ChatMessage;
use crate::team::{AgentUpdate, ModelArgs, Team};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAmendment {
    pub agent_name: String,
    pub new_prompt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AmendmentProposal {
    #[serde(default)]
    amendments: Vec<PromptAmendment>,
}

/// An amendment that changed a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedAmendment {
    pub agent_name: String,
    pub old_prompt: String,
    pub new_prompt: String,
}

impl AppliedAmendment {
    /// Line diff: `- ` removed, `+ ` added, unchanged lines omitted
    pub fn diff(&self) -> String {
        let old: Vec<&str> = self.old_prompt.lines().collect();
        let new: Vec<&str> = self.new_prompt.lines().collect();
        let mut out = format!("{}:\n", self.agent_name);
        for line in old.iter().filter(|l| !new.contains(l)) {
            out.push_str(&format!("- {}\n", line));
        }
        for line in new.iter().filter(|l| !old.contains(l)) {
            out.push_str(&format!("+ {}\n", line));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct AmendmentOutcome {
    pub team: Team,
    pub applied: Vec<AppliedAmendment>,
}

impl AmendmentOutcome {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Human-readable summary of every change
    pub fn summary(&self) -> String {
        self.applied
            .iter()
            .map(AppliedAmendment::diff)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

const AMEND_PROMPT: &str = "\
You tune the system prompts of an AI agent team. Review the conversation and notes. When an \
agent's behaviour shows its prompt is missing guidance, propose a complete replacement prompt \
for that agent that keeps everything still valid and adds what was learned. Propose nothing \
for agents that did fine. Return an empty list when no change is needed.";

fn amendment_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "amendments": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "agentName": { "type": "string" },
                        "newPrompt": { "type": "string" }
                    },
                    "required": ["agentName", "newPrompt"]
                }
            }
        },
        "required": ["amendments"]
    })
}

pub struct PromptAmender {
    llm: Arc<dyn LanguageModel>,
    model: ModelArgs,
}

impl PromptAmender {
    pub fn new(llm: Arc<dyn LanguageModel>, model: ModelArgs) -> Self {
        Self { llm, model }
    }

    /// Ask for amendments and apply them. `notes` pairs agent names with notes
    /// gathered for them this round.
    pub async fn amend(
        &self,
        team: &Team,
        history: &ConversationLog,
        notes: &[(String, String)],
    ) -> Result<AmendmentOutcome> {
        let mut prompt = String::from("CURRENT PROMPTS:\n");
        for agent in &team.agents {
            prompt.push_str(&format!("## {}\n{}\n\n", agent.name, agent.system_prompt));
        }
        prompt.push_str("CONVERSATION:\n");
        prompt.push_str(&history.transcript());
        if !notes.is_empty() {
            prompt.push_str("\nNOTES:\n");
            for (agent, note) in notes {
                prompt.push_str(&format!("- {}: {}\n", agent, note));
            }
        }

        let schema = amendment_schema();
        let messages = [ChatMessage::user(prompt)];
        let proposal: AmendmentProposal = complete_typed(
            self.llm.as_ref(),
            ObjectRequest {
                system: AMEND_PROMPT,
                messages: &messages,
                schema: &schema,
                model: &self.model,
            },
        )
        .await?;
        debug!("Amendment proposal covers {} agent(s)", proposal.amendments.len());

        Ok(apply_amendments(team, proposal.amendments))
    }
}

/// Apply proposals in order; unknown agents, empty and unchanged prompts are skipped
pub fn apply_amendments(team: &Team, amendments: Vec<PromptAmendment>) -> AmendmentOutcome {
    let mut current = team.clone();
    let mut applied = Vec::new();

    for amendment in amendments {
        let new_prompt = amendment.new_prompt.trim().to_string();
        let Some((_, agent)) = current.find_agent(&amendment.agent_name) else {
            warn!("Amendment names unknown agent '{}'", amendment.agent_name);
            continue;
        };
        if new_prompt.is_empty() || agent.system_prompt == new_prompt {
            continue;
        }
        let old_prompt = agent.system_prompt.clone();
        let agent_name = agent.name.clone();

        match current.update_agent(&agent_name, AgentUpdate::SystemPrompt(new_prompt.clone())) {
            Ok(next) => {
                info!("Amended system prompt of '{}'", agent_name);
                current = next;
                applied.push(AppliedAmendment {
                    agent_name,
                    old_prompt,
                    new_prompt,
                });
            }
            Err(e) => warn!("Could not amend '{}': {}", agent_name, e),
        }
    }

    AmendmentOutcome {
        team: current,
        applied,
    }
}
