//! Post-message orchestrator
//!
//! Runs the classifier on the message that closed a routed turn and carries
//! out what the verdict calls for. `run` always hands the envelope back; every
//! failure along the way is folded into its flag and reason.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::amend::PromptAmender;
use super::classifier::{PostMessageClassifier, Verdict};
use super::forms::{FormCreator, FormSchema, LlmFormCreator};
use super::memory::{MemoryStore, NoteStore};
use super::notes::NoteTaker;
use super::retry::{RetryPolicy, RetryPrompter, fallback_retry_prompt};
use crate::context_sets::ContextSet;
use crate::control::address;
use crate::conversation::ConversationLog;
use crate::llm::LanguageModel;
use crate::router::{MessageRouter, RouteRequest};
use crate::team::{AgentDefinition, ModelArgs, Team};
use crate::types::{AnalysisFlag, MetaData};

/// Name of the context set announcing an outstanding form
pub const PENDING_FORM_CONTEXT: &str = "Pending form";

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Budget for the classifier call
    pub timeout: Duration,
    /// Take notes and amend prompts on ANALYSIS verdicts
    pub take_notes_on_analysis: bool,
    pub retry: RetryPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            take_notes_on_analysis: true,
            retry: RetryPolicy::Disabled,
        }
    }
}

/// A form waiting for the user, and who asked for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormRequest {
    pub schema: FormSchema,
    pub requesting_agent: String,
}

/// Envelope threaded through post-message analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageAnalysis {
    pub next_flag: AnalysisFlag,
    pub message: String,
    pub history: ConversationLog,
    pub user_id: String,
    pub team: Team,
    pub current_agent_index: usize,
    pub iteration: u32,
    pub memory_worthy: bool,
    /// Log length before the turn under review; earlier entries belong to
    /// other turns
    #[serde(default)]
    pub turn_start: usize,
    /// Classifier reason, or why analysis could not settle normally
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_form: Option<FormRequest>,
    #[serde(default)]
    pub meta_data: MetaData,
    #[serde(default)]
    pub context_sets: Vec<ContextSet>,
    /// Old/new diff of prompts rewritten during this pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_amendment: Option<String>,
}

impl PostMessageAnalysis {
    pub fn new(
        message: impl Into<String>,
        history: ConversationLog,
        team: Team,
        user_id: impl Into<String>,
        current_agent_index: usize,
    ) -> Self {
        // a routed turn is one user entry plus one assistant entry
        let turn_start = history.len().saturating_sub(2);
        Self {
            next_flag: AnalysisFlag::Pending,
            message: message.into(),
            history,
            user_id: user_id.into(),
            team,
            current_agent_index,
            iteration: 0,
            memory_worthy: false,
            turn_start,
            reason: String::new(),
            request_form: None,
            meta_data: MetaData::default(),
            context_sets: Vec::new(),
            prompt_amendment: None,
        }
    }

    pub fn with_turn_start(mut self, turn_start: usize) -> Self {
        self.turn_start = turn_start;
        self
    }

    pub fn with_context_sets(mut self, context_sets: Vec<ContextSet>) -> Self {
        self.context_sets = context_sets;
        self
    }

    pub fn current_agent(&self) -> Option<&AgentDefinition> {
        self.team.agent_at(self.current_agent_index)
    }

    /// Team members that took part in the turn under review, retries included
    pub fn participants(&self) -> Vec<AgentDefinition> {
        self.history
            .participants_since(self.turn_start)
            .iter()
            .filter_map(|name| self.team.find_agent(name).map(|(_, a)| a.clone()))
            .collect()
    }
}

pub struct PostMessageOrchestrator {
    classifier: PostMessageClassifier,
    forms: Arc<dyn FormCreator>,
    memory: Arc<dyn MemoryStore>,
    notes: Arc<dyn NoteStore>,
    note_taker: NoteTaker,
    amender: PromptAmender,
    retry_prompter: RetryPrompter,
    router: Option<Arc<MessageRouter>>,
    config: AnalysisConfig,
}

impl PostMessageOrchestrator {
    /// `model` serves every analysis call: classification, forms, notes,
    /// amendments and retry prompts
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        model: ModelArgs,
        memory: Arc<dyn MemoryStore>,
        notes: Arc<dyn NoteStore>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            classifier: PostMessageClassifier::new(llm.clone(), model.clone()),
            forms: Arc::new(LlmFormCreator::new(llm.clone(), model.clone())),
            memory,
            notes,
            note_taker: NoteTaker::new(llm.clone(), model.clone()),
            amender: PromptAmender::new(llm.clone(), model.clone()),
            retry_prompter: RetryPrompter::new(llm, model),
            router: None,
            config,
        }
    }

    pub fn with_form_creator(mut self, forms: Arc<dyn FormCreator>) -> Self {
        self.forms = forms;
        self
    }

    /// Router used to re-run failing agents when retries are enabled
    pub fn with_router(mut self, router: Arc<MessageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub async fn run(&self, mut props: PostMessageAnalysis) -> PostMessageAnalysis {
        props.iteration += 1;
        props.next_flag = AnalysisFlag::Pending;
        props.prompt_amendment = None;
        debug!("Post-message analysis pass {}", props.iteration);

        let verdict = tokio::time::timeout(
            self.config.timeout,
            self.classifier
                .classify(&props.message, &props.history, &props.team),
        )
        .await;

        let classification = match verdict {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                let text = format!("{:#}", e);
                if text.to_lowercase().contains("overloaded") {
                    warn!("Classifier overloaded, passing message through: {}", text);
                    props.next_flag = AnalysisFlag::Pass;
                    props.reason = "The analysis model is overloaded; the message was passed \
                                    through without analysis. Try again later."
                        .to_string();
                } else {
                    warn!("Classifier failed: {}", text);
                    props.next_flag = AnalysisFlag::Fail;
                    props.reason = format!("Post-message analysis failed: {}", text);
                }
                return props;
            }
            Err(_) => {
                warn!(
                    "Classifier timed out after {:?}; failing the turn",
                    self.config.timeout
                );
                props.next_flag = AnalysisFlag::Fail;
                props.reason = format!(
                    "Post-message analysis timed out after {} seconds",
                    self.config.timeout.as_secs_f32()
                );
                return props;
            }
        };

        props.memory_worthy = classification.memory_worthy;
        props.reason = classification.reason;
        props.next_flag = classification.result.into();

        match classification.result {
            Verdict::InfoRequest => self.request_info(&mut props).await,
            Verdict::AuthUrl => {
                info!("Surfacing auth URL {:?}", classification.meta_data.auth_url);
                props.meta_data = classification.meta_data;
            }
            Verdict::Complete | Verdict::Pass => {
                if props.memory_worthy {
                    self.remember(&props).await;
                }
            }
            Verdict::Analysis => {
                if self.config.take_notes_on_analysis {
                    self.analyse(&mut props).await;
                }
            }
            Verdict::Fail => self.handle_failure(&mut props).await,
        }

        info!(
            "Analysis pass {} settled on {}",
            props.iteration, props.next_flag
        );
        props
    }

    async fn request_info(&self, props: &mut PostMessageAnalysis) {
        // a form is already out; asking again would loop
        if props.request_form.is_some() {
            debug!("Form already pending, not creating another");
            props.next_flag = AnalysisFlag::Pass;
            return;
        }

        match self.forms.create_form(&props.message).await {
            Ok(schema) => {
                let requesting_agent = props
                    .current_agent()
                    .map(|a| a.name.clone())
                    .unwrap_or_default();
                let who = if requesting_agent.is_empty() {
                    "The team"
                } else {
                    requesting_agent.as_str()
                };
                let rewritten = format!(
                    "{} needs a few details to continue. Please fill in the \"{}\" form.",
                    who, schema.form_name
                );

                let keys: Vec<&str> = schema.fields.iter().map(|f| f.key.as_str()).collect();
                props.context_sets.push(ContextSet::new(
                    PENDING_FORM_CONTEXT,
                    vec![
                        format!(
                            "Waiting for the user to submit the \"{}\" form requested by {}.",
                            schema.form_name, who
                        ),
                        format!("Fields: {}", keys.join(", ")),
                    ],
                ));

                props.history.replace_last_content(rewritten.clone());
                props.message = rewritten;
                debug!(
                    "Form '{}' pending for '{}'",
                    schema.form_name, requesting_agent
                );
                props.request_form = Some(FormRequest {
                    schema,
                    requesting_agent,
                });
            }
            Err(e) => warn!("Form synthesis failed, passing message through: {:#}", e),
        }
        props.next_flag = AnalysisFlag::Pass;
    }

    async fn remember(&self, props: &PostMessageAnalysis) {
        let participants = props.participants();
        match self
            .memory
            .store_memory(&props.history, &participants, &props.user_id)
            .await
        {
            Ok(()) => info!(
                "Stored memory for {} with {} participant(s)",
                props.user_id,
                participants.len()
            ),
            Err(e) => warn!("Failed to store memory: {:#}", e),
        }
    }

    async fn analyse(&self, props: &mut PostMessageAnalysis) {
        let notes = match self.note_taker.take_notes(&props.history, &props.team).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!("Note-taking failed: {:#}", e);
                None
            }
        };

        let mut taken = Vec::new();
        if let Some(notes) = notes {
            for agent in props.participants() {
                if let Err(e) = self.notes.store_note(&agent.name, &notes).await {
                    warn!("Failed to store note for '{}': {:#}", agent.name, e);
                }
                taken.push((agent.name, notes.clone()));
            }
        }

        match self.amender.amend(&props.team, &props.history, &taken).await {
            Ok(outcome) if !outcome.is_empty() => {
                info!("Amended {} prompt(s)", outcome.applied.len());
                props.prompt_amendment = Some(outcome.summary());
                props.team = outcome.team;
            }
            Ok(_) => debug!("No prompt amendments proposed"),
            Err(e) => warn!("Prompt amendment failed: {:#}", e),
        }
    }

    async fn handle_failure(&self, props: &mut PostMessageAnalysis) {
        match self.config.retry {
            RetryPolicy::Disabled => return,
            RetryPolicy::Enabled { max_attempts } if !self.config.retry.allows(props.iteration) => {
                info!("Retry budget of {} spent; settling as COMPLETE", max_attempts);
                props.next_flag = AnalysisFlag::Complete;
                return;
            }
            RetryPolicy::Enabled { .. } => {}
        }

        let Some(router) = &self.router else {
            warn!("Retries enabled without a router; leaving FAIL");
            return;
        };
        let Some(agent) = props.current_agent().cloned() else {
            warn!("No agent at index {} to retry", props.current_agent_index);
            return;
        };

        let instruction = match self
            .retry_prompter
            .retry_prompt(&agent, &props.message, &props.reason, &props.history)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("Retry prompt generation failed: {:#}", e);
                fallback_retry_prompt(&props.reason)
            }
        };

        let wire = address(&agent.name, &instruction);
        let request = RouteRequest::new(&wire, &props.history, &props.team)
            .with_context_sets(&props.context_sets);
        match router.route(request).await {
            Some(outcome) => {
                info!("Retried '{}' (attempt {})", agent.name, props.iteration);
                props.history = outcome.history;
                props.message = outcome.response;
                props.current_agent_index = outcome.agent_index;
                props.next_flag = AnalysisFlag::Continue;
            }
            None => warn!("Retry of '{}' could not be routed; leaving FAIL", agent.name),
        }
    }
}
