//! Message router - `Name:::payload` dispatch between the user and agents
//!
//! The router resolves the addressee, runs the agent's turn and, when the reply
//! addresses another agent, keeps going until a reply addresses nobody or the
//! hop limit is reached. It works on a copy of the conversation log and returns
//! the new snapshot; the caller decides whether to keep it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context_sets::ContextSet;
use crate::control::{Addressing, AgentReply, ControlToken};
use crate::conversation::ConversationLog;
use crate::knowledge::KnowledgeRetriever;
use crate::llm::{LanguageModel, TextRequest};
use crate::prompt::AgentFoundationalPrompt;
use crate::team::{AgentDefinition, Team};
use crate::types::AnalysisFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Maximum agent turns per routed message, including the first
    pub max_hops: usize,
}

impl RouterConfig {
    pub fn new(max_hops: usize) -> Self {
        Self {
            max_hops: max_hops.max(1),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { max_hops: 8 }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("message is not addressed to an agent")]
    NotAddressed,
    #[error("no agent named '{0}'")]
    UnknownAgent(String),
    #[error("agent '{0}' is disabled")]
    Disabled(String),
    #[error("agent '{recipient}' does not accept messages from '{sender}'")]
    ContactRefused { recipient: String, sender: String },
    #[error("agent '{agent}' failed to respond: {message}")]
    Invocation { agent: String, message: String },
}

/// One message to route
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub message: &'a str,
    pub history: &'a ConversationLog,
    pub team: &'a Team,
    pub context_sets: &'a [ContextSet],
    /// Agent that wrote `message`; `None` for the human user
    pub sender: Option<&'a str>,
    /// Record the first turn nested under the previous one
    pub agent_to_agent: bool,
}

impl<'a> RouteRequest<'a> {
    pub fn new(message: &'a str, history: &'a ConversationLog, team: &'a Team) -> Self {
        Self {
            message,
            history,
            team,
            context_sets: &[],
            sender: None,
            agent_to_agent: false,
        }
    }

    pub fn with_context_sets(mut self, context_sets: &'a [ContextSet]) -> Self {
        self.context_sets = context_sets;
        self
    }

    pub fn from_agent(mut self, sender: &'a str) -> Self {
        self.sender = Some(sender);
        self.agent_to_agent = true;
        self
    }
}

/// What a routed message produced
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Last agent's reply, control tokens removed
    pub response: String,
    pub history: ConversationLog,
    /// Rendered system prompt the last agent ran with
    pub context: String,
    pub agent_props: AgentFoundationalPrompt,
    /// Team index of the agent that produced `response`
    pub agent_index: usize,
    /// Agent turns taken
    pub hops: usize,
    /// Control tokens the last raw reply carried
    pub markers: Vec<ControlToken>,
    /// Set when the chain was cut short; the analysis step is skipped
    pub next_flag: Option<AnalysisFlag>,
    pub halt_reason: Option<String>,
}

struct Hop {
    agent_index: usize,
    props: AgentFoundationalPrompt,
    system: String,
    reply: AgentReply,
}

pub struct MessageRouter {
    llm: Arc<dyn LanguageModel>,
    knowledge: Option<Arc<dyn KnowledgeRetriever>>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(llm: Arc<dyn LanguageModel>, config: RouterConfig) -> Self {
        Self {
            llm,
            knowledge: None,
            config,
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeRetriever>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn config(&self) -> RouterConfig {
        self.config
    }

    /// Route a message. `None` when it addresses nobody, names an unknown or
    /// unreachable agent, or the first agent fails; the caller's log is then
    /// unchanged.
    pub async fn route(&self, request: RouteRequest<'_>) -> Option<RouteOutcome> {
        match self.try_route(request).await {
            Ok(outcome) => Some(outcome),
            Err(RouteError::NotAddressed) => {
                debug!("Message has no recipient, nothing to route");
                None
            }
            Err(e @ RouteError::UnknownAgent(_)) => {
                info!("Not routed: {}", e);
                None
            }
            Err(e) => {
                warn!("Routing failed: {}", e);
                None
            }
        }
    }

    pub async fn try_route(&self, request: RouteRequest<'_>) -> Result<RouteOutcome, RouteError> {
        let team = request.team;
        let mut log = request.history.clone();
        let mut message = request.message.to_string();
        let mut sender = request.sender.map(str::to_string);
        let mut last: Option<Hop> = None;

        for hop in 0..self.config.max_hops {
            let (recipient, payload) = match Addressing::parse(&message) {
                Addressing::Addressed { recipient, payload } => {
                    (recipient.to_string(), payload.trim().to_string())
                }
                Addressing::Unaddressed(_) => return Err(RouteError::NotAddressed),
            };

            let step = self
                .dispatch(&request, &log, &recipient, &payload, sender.as_deref())
                .await;
            let current = match step {
                Ok(current) => current,
                Err(e) => match last {
                    // a broken hand-off ends the chain; earlier turns stand
                    Some(prev) => {
                        warn!("Agent chain stopped after {} hop(s): {}", hop, e);
                        let flag = matches!(e, RouteError::Invocation { .. })
                            .then_some(AnalysisFlag::Fail);
                        let reason = flag.map(|_| e.to_string());
                        return Ok(self.finish(log, prev, hop, flag, reason));
                    }
                    None => return Err(e),
                },
            };

            if hop == 0 && !request.agent_to_agent {
                log.append_turn(&recipient, &payload, &current.reply.display);
            } else {
                log.nest_turn(&recipient, &payload, &current.reply.display);
            }
            info!(
                "Hop {}: '{}' replied ({} chars, handoff={})",
                hop + 1,
                recipient,
                current.reply.display.len(),
                current.reply.is_handoff()
            );

            if !current.reply.is_handoff() {
                return Ok(self.finish(log, current, hop + 1, None, None));
            }
            message = current.reply.display.clone();
            sender = team
                .agent_at(current.agent_index)
                .map(|a| a.name.clone());
            last = Some(current);
        }

        let done = last.ok_or(RouteError::NotAddressed)?;
        let reason = format!(
            "agent-to-agent hop limit of {} reached",
            self.config.max_hops
        );
        warn!("{}; failing the turn closed", reason);
        Ok(self.finish(
            log,
            done,
            self.config.max_hops,
            Some(AnalysisFlag::Fail),
            Some(reason),
        ))
    }

    /// Resolve the recipient and run its turn without touching the log
    async fn dispatch(
        &self,
        request: &RouteRequest<'_>,
        log: &ConversationLog,
        recipient: &str,
        payload: &str,
        sender: Option<&str>,
    ) -> Result<Hop, RouteError> {
        let (agent_index, agent) = resolve(request.team, recipient, sender)?;

        let mut props = AgentFoundationalPrompt::build(request.team, agent, request.context_sets);
        if let Some(knowledge) = self.knowledge_for(agent, payload).await {
            props = props.with_knowledge(knowledge);
        }
        let system = props.render();
        let history = log.to_chat_messages();

        debug!(
            "Dispatching to '{}' via {} (history={})",
            agent.name,
            agent.model_args,
            history.len()
        );

        let raw = self
            .llm
            .complete_text(TextRequest {
                system: &system,
                history: &history,
                input: payload,
                model: &agent.model_args,
            })
            .await
            .map_err(|e| RouteError::Invocation {
                agent: agent.name.clone(),
                message: format!("{:#}", e),
            })?;

        Ok(Hop {
            agent_index,
            props,
            system,
            reply: AgentReply::parse(&raw),
        })
    }

    async fn knowledge_for(&self, agent: &AgentDefinition, payload: &str) -> Option<String> {
        let retriever = self.knowledge.as_ref()?;
        let namespace = agent.knowledge_base.as_deref()?;
        match retriever.retrieve(namespace, payload).await {
            Ok(set) => set.map(|s| s.render()),
            Err(e) => {
                warn!("Knowledge lookup for '{}' failed: {:#}", agent.name, e);
                None
            }
        }
    }

    fn finish(
        &self,
        history: ConversationLog,
        hop: Hop,
        hops: usize,
        next_flag: Option<AnalysisFlag>,
        halt_reason: Option<String>,
    ) -> RouteOutcome {
        RouteOutcome {
            response: hop.reply.display,
            history,
            context: hop.system,
            agent_props: hop.props,
            agent_index: hop.agent_index,
            hops,
            markers: hop.reply.markers,
            next_flag,
            halt_reason,
        }
    }
}

fn resolve<'t>(
    team: &'t Team,
    recipient: &str,
    sender: Option<&str>,
) -> Result<(usize, &'t AgentDefinition), RouteError> {
    let (idx, agent) = team
        .find_agent(recipient)
        .ok_or_else(|| RouteError::UnknownAgent(recipient.to_string()))?;
    if agent.disabled {
        return Err(RouteError::Disabled(agent.name.clone()));
    }
    if !agent.accepts_messages_from(sender) {
        return Err(RouteError::ContactRefused {
            recipient: agent.name.clone(),
            sender: sender.unwrap_or_default().to_string(),
        });
    }
    Ok((idx, agent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, sample_team};
    use crate::types::MessageRole;

    fn scripted_router(model: ScriptedModel) -> (MessageRouter, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        (
            MessageRouter::new(model.clone(), RouterConfig::default()),
            model,
        )
    }

    #[tokio::test]
    async fn test_unaddressed_is_noop() {
        let (router, model) = scripted_router(ScriptedModel::new().text("never"));
        let log = ConversationLog::new();
        let team = sample_team();
        assert!(router.route(RouteRequest::new("hello team", &log, &team)).await.is_none());
        assert!(model.text_calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_attributes_turns_to_addressed_name() {
        let (router, model) = scripted_router(ScriptedModel::new().text("Here is the draft. COMPLETE"));
        let log = ConversationLog::new();
        let team = sample_team();

        let outcome = router
            .route(RouteRequest::new(
                "ScriptMaster::: please draft the onboarding email",
                &log,
                &team,
            ))
            .await
            .unwrap();

        assert_eq!(outcome.response, "Here is the draft.");
        assert_eq!(outcome.markers, vec![ControlToken::Complete]);
        assert_eq!(outcome.agent_index, 0);
        assert_eq!(outcome.hops, 1);
        assert!(outcome.next_flag.is_none());

        let entries = outcome.history.messages();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, MessageRole::User);
        assert_eq!(entries[0].content, "please draft the onboarding email");
        assert_eq!(entries[0].agent_name.as_deref(), Some("ScriptMaster"));
        assert_eq!(entries[1].role, MessageRole::Assistant);
        assert_eq!(entries[1].agent_name.as_deref(), Some("ScriptMaster"));

        // the caller's snapshot is untouched
        assert!(log.is_empty());

        let call = &model.text_calls()[0];
        assert_eq!(call.input, "please draft the onboarding email");
        assert!(call.system.contains("You are scriptmaster"));
        assert!(outcome.context.contains("# IDENTITY"));
    }

    #[tokio::test]
    async fn test_unknown_agent_returns_none() {
        let (router, _) = scripted_router(ScriptedModel::new());
        let mut log = ConversationLog::new();
        log.append_turn("Critic", "earlier", "reply");
        let team = sample_team();
        let err = router
            .try_route(RouteRequest::new("Unknown::: hello", &log, &team))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::UnknownAgent("Unknown".to_string()));
        assert!(router.route(RouteRequest::new("Unknown::: hello", &log, &team)).await.is_none());
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_invocation_failure_commits_nothing() {
        let (router, _) = scripted_router(ScriptedModel::new().text_error("status 500"));
        let log = ConversationLog::new();
        let team = sample_team();
        let err = router
            .try_route(RouteRequest::new("Critic::: review", &log, &team))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Invocation { ref agent, .. } if agent == "Critic"));
    }

    #[tokio::test]
    async fn test_handoff_chain_nests_under_outer_turn() {
        let (router, model) = scripted_router(
            ScriptedModel::new()
                .text("Critic::: please review this draft")
                .text("Looks good. PASS"),
        );
        let log = ConversationLog::new();
        let team = sample_team();

        let outcome = router
            .route(RouteRequest::new("scriptmaster::: draft it", &log, &team))
            .await
            .unwrap();

        assert_eq!(outcome.hops, 2);
        assert_eq!(outcome.response, "Looks good.");
        assert_eq!(outcome.agent_index, 1);
        let entries = outcome.history.messages();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "Critic::: please review this draft");
        assert_eq!(entries[1].sub_messages.len(), 2);
        assert_eq!(entries[1].sub_messages[0].content, "please review this draft");
        assert_eq!(entries[1].sub_messages[1].agent_name.as_deref(), Some("Critic"));

        // second hop saw the first turn in its history
        assert_eq!(model.text_calls()[1].history_len, 2);
    }

    #[tokio::test]
    async fn test_hop_limit_fails_closed() {
        let model = Arc::new(
            ScriptedModel::new()
                .text("Critic::: one")
                .text("Planner::: two")
                .text("Critic::: three"),
        );
        let router = MessageRouter::new(model.clone(), RouterConfig::new(2));
        let log = ConversationLog::new();
        let team = sample_team();

        let outcome = router
            .route(RouteRequest::new("scriptmaster::: go", &log, &team))
            .await
            .unwrap();
        assert_eq!(outcome.hops, 2);
        assert_eq!(outcome.next_flag, Some(AnalysisFlag::Fail));
        assert!(outcome.halt_reason.unwrap().contains("hop limit of 2"));
        assert_eq!(model.text_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_broken_handoff_keeps_earlier_turns() {
        let (router, _) = scripted_router(ScriptedModel::new().text("Ghost::: are you there?"));
        let log = ConversationLog::new();
        let team = sample_team();

        let outcome = router
            .route(RouteRequest::new("Planner::: plan", &log, &team))
            .await
            .unwrap();
        assert_eq!(outcome.hops, 1);
        assert_eq!(outcome.history.len(), 2);
        assert!(outcome.next_flag.is_none());
    }

    #[tokio::test]
    async fn test_failed_second_hop_flags_fail() {
        let (router, _) = scripted_router(
            ScriptedModel::new()
                .text("Critic::: check")
                .text_error("overloaded"),
        );
        let log = ConversationLog::new();
        let team = sample_team();

        let outcome = router
            .route(RouteRequest::new("Planner::: plan", &log, &team))
            .await
            .unwrap();
        assert_eq!(outcome.next_flag, Some(AnalysisFlag::Fail));
        assert!(outcome.halt_reason.unwrap().contains("Critic"));
        assert_eq!(outcome.history.len(), 2);
    }

    #[tokio::test]
    async fn test_contact_rules_apply_to_agents_only() {
        let mut team = sample_team();
        team.agents[1].allowed_contacts = vec!["Planner".to_string()];
        let log = ConversationLog::new();

        let (router, _) = scripted_router(ScriptedModel::new().text("ok"));
        // the human user is never filtered
        assert!(router.route(RouteRequest::new("Critic::: hi", &log, &team)).await.is_some());

        let (router, _) = scripted_router(ScriptedModel::new().text("ok"));
        let err = router
            .try_route(RouteRequest::new("Critic::: hi", &log, &team).from_agent("scriptmaster"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::ContactRefused { .. }));
    }

    #[tokio::test]
    async fn test_disabled_agent_is_unroutable() {
        let mut team = sample_team();
        team.agents[2].disabled = true;
        let log = ConversationLog::new();
        let (router, _) = scripted_router(ScriptedModel::new().text("ok"));
        let err = router
            .try_route(RouteRequest::new("planner::: hi", &log, &team))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::Disabled("Planner".to_string()));
    }

    #[tokio::test]
    async fn test_agent_to_agent_request_nests_first_turn() {
        let (router, _) = scripted_router(ScriptedModel::new().text("done"));
        let mut log = ConversationLog::new();
        log.append_turn("Planner", "plan", "Critic::: check");
        let team = sample_team();

        let outcome = router
            .route(RouteRequest::new("Critic::: check", &log, &team).from_agent("Planner"))
            .await
            .unwrap();
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history.messages()[1].sub_messages.len(), 2);
    }

    #[test]
    fn test_router_config_minimum() {
        assert_eq!(RouterConfig::new(0).max_hops, 1);
        assert_eq!(RouterConfig::default().max_hops, 8);
    }
}
