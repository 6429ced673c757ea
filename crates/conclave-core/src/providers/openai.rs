//! OpenAI Chat Completions and embeddings

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http::ApiClient;
use super::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatUsage, Embedder, LlmProvider, ResponseFormat,
    StopReason,
};

fn bearer_client(api_key: &str, base_url: &str) -> ApiClient {
    let client = ApiClient::new("OpenAI", base_url);
    // local servers such as Ollama run without a key
    if api_key.is_empty() {
        client
    } else {
        client.with_header("Authorization", format!("Bearer {}", api_key))
    }
}

pub struct OpenAiProvider {
    api: ApiClient,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api", &self.api)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, base_url: String, max_tokens: u32) -> Self {
        Self {
            api: bearer_client(&api_key, &base_url),
            model,
            max_tokens,
        }
    }

    fn body<'a>(&'a self, request: &ChatRequest<'a>) -> CompletionBody<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: request.system,
        });
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        CompletionBody {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages,
            temperature: request.temperature,
            response_format: (request.format == ResponseFormat::Json)
                .then_some(FormatSpec { kind: "json_object" }),
        }
    }
}

fn into_chat_response(completion: Completion) -> Result<ChatResponse> {
    let Some(choice) = completion.choices.into_iter().next() else {
        bail!("OpenAI completion carried no choices");
    };
    let usage = completion
        .usage
        .map(|u| ChatUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        text: choice.message.content.unwrap_or_default(),
        stop_reason: match choice.finish_reason.as_deref() {
            Some("stop") => StopReason::EndTurn,
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        },
        usage,
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        let body = self.body(request);
        debug!(
            "POST /v1/chat/completions model={} messages={} format={:?}",
            self.model,
            body.messages.len(),
            request.format
        );

        let completion: Completion = self.api.post("/v1/chat/completions", &body).await?;
        into_chat_response(completion)
    }
}

/// Embeddings through `/v1/embeddings`
pub struct OpenAiEmbedder {
    api: ApiClient,
    model: String,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("api", &self.api)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api: bearer_client(&api_key, &base_url),
            model,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        debug!("POST /v1/embeddings model={} inputs={}", self.model, inputs.len());
        let body = EmbeddingBody {
            model: &self.model,
            input: inputs,
        };
        let reply: EmbeddingReply = self.api.post("/v1/embeddings", &body).await?;
        order_embeddings(reply, inputs.len())
    }
}

/// Items may arrive out of order; `index` is authoritative
fn order_embeddings(reply: EmbeddingReply, expected: usize) -> Result<Vec<Vec<f32>>> {
    let mut data = reply.data;
    if data.len() != expected {
        return Err(anyhow!(
            "Embedding reply had {} vectors for {} inputs",
            data.len(),
            expected
        ));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<FormatSpec>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct FormatSpec {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingReply {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}
