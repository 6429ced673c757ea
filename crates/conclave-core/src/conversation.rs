//! Conversation log - ordered, append-only record of a team conversation
//!
//! The log is a value type. Routing works on a clone and hands the new
//! snapshot back, so a failed dispatch never leaves a half-written turn in the
//! caller's copy. `version` increases with every mutation.

use serde::{Deserialize, Serialize};

use crate::providers::{ChatMessage, ChatRole};
use crate::types::{MessageRole, ServerMessage};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationLog {
    messages: Vec<ServerMessage>,
    #[serde(default)]
    version: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ServerMessage>) -> Self {
        Self {
            messages,
            version: 0,
        }
    }

    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ServerMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ServerMessage> {
        self.messages.last()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn push(&mut self, message: ServerMessage) {
        self.messages.push(message);
        self.version += 1;
    }

    /// Append a user turn for `payload` followed by the assistant's `reply`,
    /// both attributed to `agent_name`
    pub fn append_turn(&mut self, agent_name: &str, payload: &str, reply: &str) {
        self.messages
            .push(ServerMessage::user(payload, Some(agent_name.to_string())));
        self.messages
            .push(ServerMessage::assistant(reply, Some(agent_name.to_string())));
        self.version += 1;
    }

    /// Record an agent-to-agent exchange under the outer (last top-level) turn.
    /// With nothing to nest under, the exchange becomes a top-level turn.
    pub fn nest_turn(&mut self, agent_name: &str, payload: &str, reply: &str) {
        match self.messages.last_mut() {
            Some(outer) => {
                outer
                    .sub_messages
                    .push(ServerMessage::user(payload, Some(agent_name.to_string())));
                outer
                    .sub_messages
                    .push(ServerMessage::assistant(reply, Some(agent_name.to_string())));
                self.version += 1;
            }
            None => self.append_turn(agent_name, payload, reply),
        }
    }

    /// Replace the content of the most recent top-level entry. Returns false on an empty log.
    pub fn replace_last_content(&mut self, content: impl Into<String>) -> bool {
        match self.messages.last_mut() {
            Some(last) => {
                last.content = content.into();
                self.version += 1;
                true
            }
            None => false,
        }
    }

    /// Top-level turns in provider-agnostic form. Nested exchanges stay out of
    /// the model's context; the outer turn already carries their result.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage {
                role: match m.role {
                    MessageRole::User => ChatRole::User,
                    MessageRole::Assistant => ChatRole::Assistant,
                },
                content: m.content.clone(),
            })
            .collect()
    }

    /// Distinct agent names appearing anywhere in the log, in first-seen order
    pub fn participants(&self) -> Vec<String> {
        self.participants_since(0)
    }

    /// Agents named in top-level entries from `start` onwards, nested
    /// exchanges included
    pub fn participants_since(&self, start: usize) -> Vec<String> {
        fn walk(messages: &[ServerMessage], out: &mut Vec<String>) {
            for m in messages {
                if let Some(name) = &m.agent_name {
                    let seen = out.iter().any(|n| n.to_lowercase() == name.to_lowercase());
                    if !seen {
                        out.push(name.clone());
                    }
                }
                walk(&m.sub_messages, out);
            }
        }
        let mut names = Vec::new();
        let start = start.min(self.messages.len());
        walk(&self.messages[start..], &mut names);
        names
    }

    /// Plain-text rendering including nested exchanges, for analysis prompts
    pub fn transcript(&self) -> String {
        fn walk(messages: &[ServerMessage], depth: usize, out: &mut String) {
            for m in messages {
                let speaker = match (&m.role, &m.agent_name) {
                    (MessageRole::User, Some(name)) => format!("user → {}", name),
                    (MessageRole::Assistant, Some(name)) => name.clone(),
                    (role, None) => role.to_string(),
                };
                out.push_str(&"  ".repeat(depth));
                out.push_str(&format!("[{}] {}\n", speaker, m.content));
                walk(&m.sub_messages, depth + 1, out);
            }
        }
        let mut out = String::new();
        walk(&self.messages, 0, &mut out);
        out
    }
}
