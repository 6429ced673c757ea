//! Any server that speaks the Chat Completions wire at its own base URL
//! (Ollama, Groq, LM Studio and the like)

use anyhow::Result;
use async_trait::async_trait;

use super::openai::OpenAiProvider;
use super::types::{ChatRequest, ChatResponse, LlmProvider};

/// [`OpenAiProvider`] under the name agents use in their model args
pub struct OpenAiCompatProvider {
    inner: OpenAiProvider,
    name: String,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .finish()
    }
}

impl OpenAiCompatProvider {
    /// `base_url` is the server root without `/v1`, e.g. `http://localhost:11434`
    pub fn new(
        name: String,
        api_key: String,
        model: String,
        base_url: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            inner: OpenAiProvider::new(api_key, model, base_url, max_tokens),
            name,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        self.inner.chat(request).await
    }
}
