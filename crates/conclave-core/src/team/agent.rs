//! Agent definition - identity, model, prompt, tools and contact rules

use serde::{Deserialize, Serialize};

/// Which provider/model an agent talks through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArgs {
    /// Provider key, e.g. "anthropic", "openai" or a configured compatible endpoint name
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ModelArgs {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

impl std::fmt::Display for ModelArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Task agents converse; tool agents wrap a capability and answer tersely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Task,
    Tool,
}

/// One configured LLM persona belonging to a team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub role_description: String,
    #[serde(default, rename = "type")]
    pub kind: AgentKind,
    pub model_args: ModelArgs,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub prompt_directives: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Agents allowed to address this one. Empty = anyone.
    #[serde(default)]
    pub allowed_contacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Vector-store namespace backing this agent's knowledge base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub training: bool,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model_args: ModelArgs) -> Self {
        Self {
            name: name.into(),
            title: String::new(),
            role_description: String::new(),
            kind: AgentKind::Task,
            model_args,
            system_prompt: String::new(),
            prompt_directives: Vec::new(),
            tools: Vec::new(),
            allowed_contacts: Vec::new(),
            voice: None,
            knowledge_base: None,
            disabled: false,
            training: false,
        }
    }

    /// Case-insensitive, whitespace-trimmed name comparison
    pub fn is_named(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }

    /// Whether `sender` may address this agent. `None` is the human user, who always may.
    pub fn accepts_messages_from(&self, sender: Option<&str>) -> bool {
        match sender {
            None => true,
            Some(_) if self.allowed_contacts.is_empty() => true,
            Some(sender) => self
                .allowed_contacts
                .iter()
                .any(|c| c.trim().to_lowercase() == sender.trim().to_lowercase()),
        }
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

/// Field-level update applied to an agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentUpdate {
    Name(String),
    Title(String),
    RoleDescription(String),
    SystemPrompt(String),
    AddDirective(String),
    Model(ModelArgs),
    Voice(Option<String>),
    Tools(Vec<String>),
    AllowedContacts(Vec<String>),
    KnowledgeBase(Option<String>),
    Disabled(bool),
    Training(bool),
}

impl AgentDefinition {
    pub(crate) fn apply(&mut self, update: AgentUpdate) {
        match update {
            AgentUpdate::Name(name) => self.name = name,
            AgentUpdate::Title(title) => self.title = title,
            AgentUpdate::RoleDescription(role) => self.role_description = role,
            AgentUpdate::SystemPrompt(prompt) => self.system_prompt = prompt,
            AgentUpdate::AddDirective(directive) => self.prompt_directives.push(directive),
            AgentUpdate::Model(args) => self.model_args = args,
            AgentUpdate::Voice(voice) => self.voice = voice,
            AgentUpdate::Tools(tools) => self.tools = tools,
            AgentUpdate::AllowedContacts(contacts) => self.allowed_contacts = contacts,
            AgentUpdate::KnowledgeBase(kb) => self.knowledge_base = kb,
            AgentUpdate::Disabled(disabled) => self.disabled = disabled,
            AgentUpdate::Training(training) => self.training = training,
        }
    }
}
