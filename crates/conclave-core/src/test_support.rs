//! Scripted doubles shared by the unit tests

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::llm::{LanguageModel, ObjectRequest, TextRequest};
use crate::team::{AgentDefinition, ModelArgs, Team};

/// One recorded call into [`ScriptedModel`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    /// Text input for agent turns, last message content for structured calls
    pub input: String,
    pub history_len: usize,
    pub model: ModelArgs,
    pub schema: Option<Value>,
}

/// Language model that replays queued answers in order
#[derive(Default)]
pub struct ScriptedModel {
    texts: Mutex<VecDeque<Result<String, String>>>,
    objects: Mutex<VecDeque<Result<Value, String>>>,
    text_calls: Mutex<Vec<RecordedCall>>,
    object_calls: Mutex<Vec<RecordedCall>>,
    object_delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(self, reply: &str) -> Self {
        self.texts.lock().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    pub fn text_error(self, error: &str) -> Self {
        self.texts.lock().unwrap().push_back(Err(error.to_string()));
        self
    }

    pub fn object(self, value: Value) -> Self {
        self.objects.lock().unwrap().push_back(Ok(value));
        self
    }

    pub fn object_error(self, error: &str) -> Self {
        self.objects.lock().unwrap().push_back(Err(error.to_string()));
        self
    }

    /// Every structured call sleeps this long before answering
    pub fn object_delay(mut self, delay: Duration) -> Self {
        self.object_delay = Some(delay);
        self
    }

    pub fn text_calls(&self) -> Vec<RecordedCall> {
        self.text_calls.lock().unwrap().clone()
    }

    pub fn object_calls(&self) -> Vec<RecordedCall> {
        self.object_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete_text(&self, request: TextRequest<'_>) -> Result<String> {
        self.text_calls.lock().unwrap().push(RecordedCall {
            system: request.system.to_string(),
            input: request.input.to_string(),
            history_len: request.history.len(),
            model: request.model.clone(),
            schema: None,
        });
        let next = self.texts.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(anyhow!("{}", e)),
            None => Err(anyhow!("text script exhausted")),
        }
    }

    async fn complete_object(&self, request: ObjectRequest<'_>) -> Result<Value> {
        self.object_calls.lock().unwrap().push(RecordedCall {
            system: request.system.to_string(),
            input: request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            history_len: request.messages.len(),
            model: request.model.clone(),
            schema: Some(request.schema.clone()),
        });
        if let Some(delay) = self.object_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.objects.lock().unwrap().pop_front();
        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(anyhow!("{}", e)),
            None => Err(anyhow!("object script exhausted")),
        }
    }
}

pub fn model() -> ModelArgs {
    ModelArgs::new("openai", "gpt-4o")
}

/// `scriptmaster`, `Critic` and `Planner`
pub fn sample_team() -> Team {
    let mut writer = AgentDefinition::new("scriptmaster", model());
    writer.title = "Copywriter".to_string();
    writer.system_prompt = "You write onboarding copy.".to_string();

    let mut critic = AgentDefinition::new("Critic", model());
    critic.title = "Editor".to_string();

    let planner = AgentDefinition::new("Planner", model());

    let mut team = Team::new("Launch", "Ship the onboarding flow");
    team.agents = vec![writer, critic, planner];
    team
}
