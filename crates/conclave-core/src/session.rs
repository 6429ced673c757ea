//! Team session - one user turn end to end
//!
//! Routes the user's message, runs post-message analysis on the reply and
//! keeps the resulting snapshots (history, team, context sets, pending form).

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::analysis::{FormRequest, PENDING_FORM_CONTEXT, PostMessageAnalysis, PostMessageOrchestrator};
use crate::context_sets::ContextSet;
use crate::control::{Addressing, address};
use crate::conversation::ConversationLog;
use crate::router::{MessageRouter, RouteRequest};
use crate::team::Team;
use crate::types::{AnalysisFlag, MetaData};

/// Who receives a message that addresses nobody
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// The agent that replied last
    #[default]
    Sticky,
    /// Rotate through enabled agents after every turn
    RoundRobin,
}

/// Everything a session carries between turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub team: Team,
    pub history: ConversationLog,
    #[serde(default)]
    pub context_sets: Vec<ContextSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_form: Option<FormRequest>,
    #[serde(default)]
    pub current_agent: usize,
}

impl SessionState {
    pub fn new(team: Team) -> Self {
        Self {
            team,
            history: ConversationLog::new(),
            context_sets: Vec::new(),
            pending_form: None,
            current_agent: 0,
        }
    }
}

/// Result of one user turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub response: String,
    pub agent_name: String,
    pub flag: AnalysisFlag,
    pub reason: String,
    pub hops: usize,
    /// Analysis passes, more than one when retries ran
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_form: Option<FormRequest>,
    pub meta_data: MetaData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_amendment: Option<String>,
}

pub struct TeamSession {
    router: Arc<MessageRouter>,
    orchestrator: PostMessageOrchestrator,
    state: SessionState,
    user_id: String,
    turn_policy: TurnPolicy,
}

impl TeamSession {
    pub fn new(
        router: Arc<MessageRouter>,
        orchestrator: PostMessageOrchestrator,
        state: SessionState,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            router,
            orchestrator,
            state,
            user_id: user_id.into(),
            turn_policy: TurnPolicy::default(),
        }
    }

    pub fn with_turn_policy(mut self, policy: TurnPolicy) -> Self {
        self.turn_policy = policy;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn into_state(self) -> SessionState {
        self.state
    }

    /// Name of the agent unaddressed text goes to
    pub fn current_agent(&self) -> Option<&str> {
        self.state
            .team
            .agent_at(self.state.current_agent)
            .map(|a| a.name.as_str())
    }

    /// Route `text` and analyse the reply. Unaddressed text goes to the
    /// current agent.
    pub async fn submit(&mut self, text: &str) -> Result<TurnReport> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Cannot submit an empty message");
        }

        let wire = match Addressing::parse(text) {
            Addressing::Addressed { .. } => text.to_string(),
            Addressing::Unaddressed(body) => {
                let Some(agent) = self.current_agent() else {
                    bail!("Team '{}' has no agent to talk to", self.state.team.name);
                };
                debug!("Unaddressed message goes to '{}'", agent);
                address(agent, body)
            }
        };
        if let Some(form) = &self.state.pending_form {
            info!(
                "Dropping pending form '{}', the user moved on without answering it",
                form.schema.form_name
            );
            self.clear_pending_form();
        }
        self.run_turn(&wire).await
    }

    /// Send the user's answers to a pending form back to the agent that asked
    pub async fn submit_form(&mut self, values: &Value) -> Result<TurnReport> {
        let Some(form) = self.state.pending_form.clone() else {
            bail!("No form is pending");
        };
        let Some(fields) = values.as_object() else {
            bail!("Form values must be a JSON object");
        };

        let mut body = format!("Form \"{}\" submitted:", form.schema.form_name);
        for field in &form.schema.fields {
            let value = match fields.get(&field.key) {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => "(not provided)".to_string(),
            };
            body.push_str(&format!("\n{}: {}", field.key, value));
        }

        let recipient = if form.requesting_agent.is_empty() {
            self.current_agent()
                .map(str::to_string)
                .context("Team has no agent to receive the form")?
        } else {
            form.requesting_agent.clone()
        };

        self.clear_pending_form();
        info!("Submitting form '{}' to '{}'", form.schema.form_name, recipient);
        self.run_turn(&address(&recipient, &body)).await
    }

    fn clear_pending_form(&mut self) {
        self.state.pending_form = None;
        self.state
            .context_sets
            .retain(|c| c.name != PENDING_FORM_CONTEXT);
    }

    async fn run_turn(&mut self, wire: &str) -> Result<TurnReport> {
        let turn_start = self.state.history.len();
        let request = RouteRequest::new(wire, &self.state.history, &self.state.team)
            .with_context_sets(&self.state.context_sets);
        let outcome = self.router.try_route(request).await?;

        let agent_name = outcome.agent_props.agent_name.clone();
        self.state.history = outcome.history;
        self.state.current_agent = outcome.agent_index;

        if let Some(flag) = outcome.next_flag {
            info!("Routing halted with {}; skipping analysis", flag);
            self.advance_turn();
            return Ok(TurnReport {
                response: outcome.response,
                agent_name,
                flag,
                reason: outcome.halt_reason.unwrap_or_default(),
                hops: outcome.hops,
                iterations: 0,
                request_form: None,
                meta_data: MetaData::default(),
                prompt_amendment: None,
            });
        }

        let mut props = PostMessageAnalysis::new(
            outcome.response,
            self.state.history.clone(),
            self.state.team.clone(),
            self.user_id.clone(),
            outcome.agent_index,
        )
        .with_turn_start(turn_start)
        .with_context_sets(self.state.context_sets.clone());

        // CONTINUE means a retry was routed and needs analysing in turn
        loop {
            props = self.orchestrator.run(props).await;
            if props.next_flag != AnalysisFlag::Continue {
                break;
            }
        }

        let agent_name = props
            .current_agent()
            .map(|a| a.name.clone())
            .unwrap_or(agent_name);
        let prompt_amendment = props.prompt_amendment.clone();
        self.state.history = props.history;
        self.state.team = props.team;
        self.state.context_sets = props.context_sets;
        self.state.pending_form = props.request_form.clone();
        self.state.current_agent = props.current_agent_index;
        self.advance_turn();

        Ok(TurnReport {
            response: props.message,
            agent_name,
            flag: props.next_flag,
            reason: props.reason,
            hops: outcome.hops,
            iterations: props.iteration,
            request_form: props.request_form,
            meta_data: props.meta_data,
            prompt_amendment,
        })
    }

    fn advance_turn(&mut self) {
        if self.turn_policy != TurnPolicy::RoundRobin {
            return;
        }
        let agents = &self.state.team.agents;
        let start = self.state.current_agent;
        for step in 1..=agents.len() {
            let idx = (start + step) % agents.len();
            if !agents[idx].disabled {
                self.state.current_agent = idx;
                return;
            }
        }
    }
}
