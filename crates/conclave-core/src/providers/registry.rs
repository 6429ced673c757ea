//! Provider registry - turns an agent's `ModelArgs` into a failover chain
//!
//! Each configured provider carries its credentials and, optionally, a
//! fallback model. A request for `provider/model` is served by that provider
//! first, then by every other provider in the failover order that has a
//! fallback model. Chains are built lazily and cached per `provider/model`.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::anthropic::AnthropicProvider;
use super::openai::{OpenAiEmbedder, OpenAiProvider};
use super::openai_compat::OpenAiCompatProvider;
use super::router::ModelRouter;
use super::types::{ChatMessage, ChatRequest, LlmProvider, ResponseFormat};
use crate::llm::{LanguageModel, ObjectRequest, TextRequest, extract_json, schema_instruction};
use crate::team::ModelArgs;

/// Wire protocol a provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    /// OpenAI wire format at a custom base URL
    OpenAiCompat,
}

/// One configured provider endpoint
#[derive(Clone)]
pub struct ProviderEndpoint {
    /// Key agents use in `ModelArgs::provider`
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    /// Model used when this provider serves as a fallback for another
    pub fallback_model: Option<String>,
}

impl std::fmt::Debug for ProviderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpoint")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("fallback_model", &self.fallback_model)
            .finish()
    }
}

impl ProviderEndpoint {
    fn build(&self, model: &str, max_tokens: u32) -> Box<dyn LlmProvider> {
        match self.kind {
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new(
                self.api_key.clone(),
                model.to_string(),
                self.base_url.clone(),
                max_tokens,
            )),
            ProviderKind::OpenAi => Box::new(OpenAiProvider::new(
                self.api_key.clone(),
                model.to_string(),
                self.base_url.clone(),
                max_tokens,
            )),
            ProviderKind::OpenAiCompat => Box::new(OpenAiCompatProvider::new(
                self.name.clone(),
                self.api_key.clone(),
                model.to_string(),
                self.base_url.clone(),
                max_tokens,
            )),
        }
    }
}

/// Configured providers plus the cache of per-model failover chains
pub struct ProviderRegistry {
    endpoints: Vec<ProviderEndpoint>,
    max_tokens: u32,
    max_retries: u32,
    retry_delay: Duration,
    routers: Mutex<HashMap<String, Arc<ModelRouter>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("endpoints", &self.endpoints)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ProviderRegistry {
    /// `endpoints` are given in failover order
    pub fn new(endpoints: Vec<ProviderEndpoint>, max_tokens: u32) -> Self {
        Self {
            endpoints,
            max_tokens,
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            routers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn endpoint(&self, name: &str) -> Option<&ProviderEndpoint> {
        self.endpoints.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn endpoint_names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.name.as_str()).collect()
    }

    /// Pin a prebuilt chain for `model`, bypassing endpoint construction
    pub fn insert_router(&self, model: &ModelArgs, router: ModelRouter) {
        self.lock_routers().insert(cache_key(model), Arc::new(router));
    }

    /// Failover chain serving `model`
    pub fn router_for(&self, model: &ModelArgs) -> Result<Arc<ModelRouter>> {
        let key = cache_key(model);
        if let Some(router) = self.lock_routers().get(&key) {
            return Ok(router.clone());
        }

        let primary = self.endpoint(&model.provider).ok_or_else(|| {
            anyhow!(
                "Unknown provider '{}' (configured: {})",
                model.provider,
                self.endpoint_names().join(", ")
            )
        })?;

        let mut chain = vec![primary.build(&model.model, self.max_tokens)];
        for endpoint in &self.endpoints {
            if endpoint.name.eq_ignore_ascii_case(&primary.name) {
                continue;
            }
            if let Some(fallback) = &endpoint.fallback_model {
                chain.push(endpoint.build(fallback, self.max_tokens));
            }
        }

        let router = ModelRouter::new(chain)?.with_retry(self.max_retries, self.retry_delay);
        info!("Built model chain for {}: {:?}", model, router);

        let router = Arc::new(router);
        self.lock_routers().insert(key, router.clone());
        Ok(router)
    }

    /// Embedder for a provider speaking the OpenAI wire format
    pub fn embedder(&self, provider: &str, embedding_model: &str) -> Result<OpenAiEmbedder> {
        let endpoint = self
            .endpoint(provider)
            .ok_or_else(|| anyhow!("Unknown provider '{}'", provider))?;
        match endpoint.kind {
            ProviderKind::OpenAi | ProviderKind::OpenAiCompat => Ok(OpenAiEmbedder::new(
                endpoint.api_key.clone(),
                embedding_model.to_string(),
                endpoint.base_url.clone(),
            )),
            ProviderKind::Anthropic => Err(anyhow!(
                "Provider '{}' has no embeddings endpoint",
                provider
            )),
        }
    }

    fn lock_routers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ModelRouter>>> {
        self.routers.lock().unwrap_or_else(|poisoned| {
            warn!("Router cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn cache_key(model: &ModelArgs) -> String {
    format!("{}/{}", model.provider.to_lowercase(), model.model)
}

#[async_trait]
impl LanguageModel for ProviderRegistry {
    async fn complete_text(&self, request: TextRequest<'_>) -> Result<String> {
        let router = self.router_for(request.model)?;
        let mut messages = request.history.to_vec();
        messages.push(ChatMessage::user(request.input));

        debug!(
            "Text completion via {}: history={}, input_len={}",
            request.model,
            request.history.len(),
            request.input.len()
        );

        let response = router
            .chat(&ChatRequest {
                system: request.system,
                messages: &messages,
                temperature: request.model.temperature,
                format: ResponseFormat::Text,
            })
            .await?;
        Ok(response.text)
    }

    async fn complete_object(&self, request: ObjectRequest<'_>) -> Result<Value> {
        let router = self.router_for(request.model)?;
        let system = format!("{}{}", request.system, schema_instruction(request.schema));

        debug!(
            "Object completion via {}: messages={}",
            request.model,
            request.messages.len()
        );

        let response = router
            .chat(&ChatRequest {
                system: &system,
                messages: request.messages,
                temperature: request.model.temperature,
                format: ResponseFormat::Json,
            })
            .await?;
        extract_json(&response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::{ChatResponse, ChatUsage, StopReason};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint(name: &str, kind: ProviderKind, fallback: Option<&str>) -> ProviderEndpoint {
        ProviderEndpoint {
            name: name.to_string(),
            kind,
            api_key: format!("{}-secret", name),
            base_url: "http://localhost:1".to_string(),
            fallback_model: fallback.map(|s| s.to_string()),
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(
            vec![
                endpoint("anthropic", ProviderKind::Anthropic, Some("claude-haiku-4-5")),
                endpoint("openai", ProviderKind::OpenAi, Some("gpt-4o-mini")),
                endpoint("ollama", ProviderKind::OpenAiCompat, None),
            ],
            1024,
        )
    }

    #[test]
    fn test_router_chain_uses_fallbacks() {
        let reg = registry();
        let router = reg.router_for(&ModelArgs::new("openai", "gpt-4o")).unwrap();
        // openai primary + anthropic fallback; ollama has no fallback model
        assert_eq!(router.describe(), "openai/gpt-4o -> anthropic/claude-haiku-4-5");

        let local = reg.router_for(&ModelArgs::new("Ollama", "llama3")).unwrap();
        assert_eq!(local.len(), 3);
        assert!(local.describe().starts_with("ollama/llama3 -> "));
    }

    #[test]
    fn test_router_cached_per_model() {
        let reg = registry();
        let a = reg.router_for(&ModelArgs::new("openai", "gpt-4o")).unwrap();
        let b = reg.router_for(&ModelArgs::new("openai", "gpt-4o")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = reg.router_for(&ModelArgs::new("openai", "o3")).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_unknown_provider() {
        let err = registry()
            .router_for(&ModelArgs::new("mistral", "large"))
            .unwrap_err();
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn test_embedder_requires_openai_wire() {
        let reg = registry();
        assert!(reg.embedder("openai", "text-embedding-3-small").is_ok());
        assert!(reg.embedder("ollama", "nomic-embed-text").is_ok());
        assert!(reg.embedder("anthropic", "x").is_err());
    }

    #[test]
    fn test_debug_hides_keys() {
        let debug = format!("{:?}", registry());
        assert!(!debug.contains("secret"));
    }

    struct EchoProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn provider_name(&self) -> &str {
            "echo"
        }
        fn model(&self) -> &str {
            "echo-1"
        }
        async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = match request.format {
                ResponseFormat::Json => format!(
                    "Here you go: {{\"messages\": {}, \"has_schema\": {}}}",
                    request.messages.len(),
                    request.system.contains("OUTPUT FORMAT")
                ),
                ResponseFormat::Text => request
                    .messages
                    .last()
                    .map(|m| format!("echo: {}", m.content))
                    .unwrap_or_default(),
            };
            Ok(ChatResponse {
                text,
                stop_reason: StopReason::EndTurn,
                usage: ChatUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_language_model_over_pinned_router() {
        let reg = registry();
        let model = ModelArgs::new("echo", "echo-1");
        let calls = Arc::new(AtomicUsize::new(0));
        reg.insert_router(
            &model,
            ModelRouter::single(Box::new(EchoProvider {
                calls: calls.clone(),
            })),
        );

        let history = vec![ChatMessage::user("earlier"), ChatMessage::assistant("reply")];
        let text = reg
            .complete_text(TextRequest {
                system: "sys",
                history: &history,
                input: "now",
                model: &model,
            })
            .await
            .unwrap();
        assert_eq!(text, "echo: now");

        let schema = serde_json::json!({"type": "object"});
        let value = reg
            .complete_object(ObjectRequest {
                system: "sys",
                messages: &history,
                schema: &schema,
                model: &model,
            })
            .await
            .unwrap();
        assert_eq!(value["messages"], 2);
        assert_eq!(value["has_schema"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
