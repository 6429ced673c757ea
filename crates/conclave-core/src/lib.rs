//! conclave-core - routing and analysis for teams of LLM agents
//!
//! This crate provides:
//! - Team and agent definitions with copy-on-write updates
//! - `Name:::payload` addressing and agent-to-agent hand-offs
//! - Provider clients (Anthropic, OpenAI, OpenAI-compatible) with failover
//! - Post-message classification and the actions it drives (forms, auth
//!   links, memory, notes, prompt amendment, retries)
//! - A session façade running one user turn end to end

pub mod analysis;
pub mod context_sets;
pub mod control;
pub mod conversation;
pub mod knowledge;
pub mod llm;
pub mod prompt;
pub mod providers;
pub mod router;
pub mod session;
pub mod team;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export main types for convenience
pub use analysis::{
    AnalysisConfig, Classification, FormSchema, PostMessageAnalysis, PostMessageClassifier,
    PostMessageOrchestrator, RetryPolicy, Verdict,
};
pub use context_sets::ContextSet;
pub use control::{Addressing, AgentReply, ControlToken, address, strip_control_tokens};
pub use conversation::ConversationLog;
pub use knowledge::{KnowledgeRetriever, VectorKnowledgeRetriever};
pub use llm::{LanguageModel, ObjectRequest, TextRequest};
pub use prompt::AgentFoundationalPrompt;
pub use providers::{ModelRouter, ProviderEndpoint, ProviderKind, ProviderRegistry};
pub use router::{MessageRouter, RouteError, RouteOutcome, RouteRequest, RouterConfig};
pub use session::{SessionState, TeamSession, TurnPolicy, TurnReport};
pub use team::{AgentDefinition, AgentKind, AgentUpdate, ModelArgs, Team, TeamError};
pub use types::{AnalysisFlag, MessageRole, MetaData, ServerMessage};
