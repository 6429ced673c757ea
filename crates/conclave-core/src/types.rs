//! Shared types for conclave-core

use serde::{Deserialize, Serialize};

/// Who produced a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Agent-to-agent exchange that happened while producing this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_messages: Vec<ServerMessage>,
}

impl ServerMessage {
    pub fn user(content: impl Into<String>, agent_name: Option<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            agent_name,
            sub_messages: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, agent_name: Option<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            agent_name,
            sub_messages: Vec::new(),
        }
    }
}

/// State of the post-message control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisFlag {
    /// Classifier has not run yet
    #[default]
    Pending,
    Pass,
    Fail,
    Complete,
    Analysis,
    AuthUrl,
    InfoRequest,
    Continue,
}

impl AnalysisFlag {
    /// Flags after which the surrounding loop should stop and hand control back to the user
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Continue)
    }
}

impl std::fmt::Display for AnalysisFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Complete => "COMPLETE",
            Self::Analysis => "ANALYSIS",
            Self::AuthUrl => "AUTH_URL",
            Self::InfoRequest => "INFO_REQUEST",
            Self::Continue => "CONTINUE",
        };
        write!(f, "{}", s)
    }
}

/// Extra payload attached when a message surfaces an authorization link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}
