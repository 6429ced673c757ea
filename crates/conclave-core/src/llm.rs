//! Language-model capability used by the router and the analysis pipeline
//!
//! Two shapes of call: free text for agent turns, and a JSON object matching a
//! schema for classification, form synthesis and prompt amendment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::providers::ChatMessage;
use crate::team::ModelArgs;

/// An agent turn: full history plus the new input
#[derive(Debug, Clone, Copy)]
pub struct TextRequest<'a> {
    pub system: &'a str,
    pub history: &'a [ChatMessage],
    pub input: &'a str,
    pub model: &'a ModelArgs,
}

/// A structured call answered with a JSON object shaped by `schema`
#[derive(Debug, Clone, Copy)]
pub struct ObjectRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    /// JSON Schema describing the expected object
    pub schema: &'a Value,
    pub model: &'a ModelArgs,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_text(&self, request: TextRequest<'_>) -> Result<String>;

    async fn complete_object(&self, request: ObjectRequest<'_>) -> Result<Value>;
}

/// Structured call deserialised straight into `T`
pub async fn complete_typed<T: DeserializeOwned>(
    llm: &dyn LanguageModel,
    request: ObjectRequest<'_>,
) -> Result<T> {
    let value = llm.complete_object(request).await?;
    serde_json::from_value(value).context("Model output did not match the expected shape")
}

/// Pull the first JSON object out of free text (models often add preamble or fences)
pub fn extract_json(text: &str) -> Result<Value> {
    let start = text.find('{').context("No JSON object found in response")?;
    let end = text.rfind('}').context("No closing brace found in response")?;
    anyhow::ensure!(end > start, "No JSON object found in response");
    serde_json::from_str(&text[start..=end]).context("Failed to parse JSON from response")
}

/// System prompt suffix instructing a text-only model to answer with `schema`
pub fn schema_instruction(schema: &Value) -> String {
    let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "\n\n# OUTPUT FORMAT\nRespond with a single JSON object and nothing else. \
         It must validate against this JSON Schema:\n{}",
        pretty
    )
}
