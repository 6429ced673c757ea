//! Multi-provider LLM abstraction layer
//!
//! Supports Anthropic, OpenAI, and any OpenAI-compatible endpoint.
//! Providers implement the [`LlmProvider`] trait and are composed via [`ModelRouter`]
//! for automatic failover. [`ProviderRegistry`] maps an agent's model args onto
//! such a chain and exposes it as a [`crate::llm::LanguageModel`].

pub mod anthropic;
pub mod http;
pub mod openai;
pub mod openai_compat;
pub mod registry;
pub mod router;
pub mod types;

pub use http::{ApiClient, ApiError};
pub use openai::OpenAiEmbedder;
pub use registry::{ProviderEndpoint, ProviderKind, ProviderRegistry};
pub use router::{ErrorClass, ModelRouter, classify_error};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, Embedder, LlmProvider, ResponseFormat,
};
