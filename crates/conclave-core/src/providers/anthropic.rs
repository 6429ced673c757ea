//! Anthropic Messages API

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http::ApiClient;
use super::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, ChatUsage, LlmProvider, ResponseFormat,
    StopReason,
};

const API_VERSION: &str = "2023-06-01";

/// No JSON mode on this API: an assistant turn holding an opening brace
/// makes the model continue a bare object.
const JSON_PREFILL: &str = "{";

pub struct AnthropicProvider {
    api: ApiClient,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api", &self.api)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: String, max_tokens: u32) -> Self {
        let api = ApiClient::new("Anthropic", &base_url)
            .with_header("x-api-key", api_key)
            .with_header("anthropic-version", API_VERSION);
        Self {
            api,
            model,
            max_tokens,
        }
    }
}

/// System entries travel in the top-level `system` field instead
fn wire_turns(messages: &[ChatMessage], format: ResponseFormat) -> Vec<Turn<'_>> {
    let mut turns: Vec<Turn<'_>> = messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                ChatRole::System => return None,
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            Some(Turn {
                role,
                content: &m.content,
            })
        })
        .collect();
    if format == ResponseFormat::Json {
        turns.push(Turn {
            role: "assistant",
            content: JSON_PREFILL,
        });
    }
    turns
}

fn into_chat_response(reply: MessagesReply, format: ResponseFormat) -> ChatResponse {
    let mut text = String::new();
    for block in reply.content {
        if let Block::Text { text: part } = block {
            text.push_str(&part);
        }
    }
    // the prefill is not echoed back
    if format == ResponseFormat::Json && !text.trim_start().starts_with('{') {
        text.insert_str(0, JSON_PREFILL);
    }

    ChatResponse {
        text,
        stop_reason: match reply.stop_reason.as_deref() {
            Some("end_turn" | "stop_sequence") => StopReason::EndTurn,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        },
        usage: ChatUsage {
            input_tokens: reply.usage.input_tokens,
            output_tokens: reply.usage.output_tokens,
        },
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        let body = MessagesBody {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: request.system,
            messages: wire_turns(request.messages, request.format),
            temperature: request.temperature,
        };
        debug!(
            "POST /v1/messages model={} turns={} format={:?}",
            self.model,
            body.messages.len(),
            request.format
        );

        let reply: MessagesReply = self.api.post("/v1/messages", &body).await?;
        debug!("Anthropic stop_reason={:?}", reply.stop_reason);
        Ok(into_chat_response(reply, request.format))
    }
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Turn<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, PartialEq, Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    content: Vec<Block>,
    stop_reason: Option<String>,
    usage: ReplyUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ReplyUsage {
    input_tokens: u32,
    output_tokens: u32,
}
