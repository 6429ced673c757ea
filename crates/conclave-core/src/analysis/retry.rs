//! Retry after a FAIL verdict

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::ConversationLog;
use crate::llm::{LanguageModel, TextRequest};
use crate::team::{AgentDefinition, ModelArgs};

/// What the orchestrator does with a FAIL verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// FAIL is handed back to the caller unchanged
    #[default]
    Disabled,
    /// Re-run the failing agent with a corrective prompt, up to `max_attempts`
    /// times per user message; once exhausted the turn settles as COMPLETE
    Enabled { max_attempts: u32 },
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `iteration` analysis passes
    pub fn allows(&self, iteration: u32) -> bool {
        match self {
            Self::Disabled => false,
            Self::Enabled { max_attempts } => iteration <= *max_attempts,
        }
    }
}

const RETRY_PROMPT: &str = "\
An AI agent's last reply failed its task. Write one short instruction addressed to that agent \
telling it what went wrong and what to do instead. Output only the instruction.";

pub struct RetryPrompter {
    llm: Arc<dyn LanguageModel>,
    model: ModelArgs,
}

impl RetryPrompter {
    pub fn new(llm: Arc<dyn LanguageModel>, model: ModelArgs) -> Self {
        Self { llm, model }
    }

    pub async fn retry_prompt(
        &self,
        agent: &AgentDefinition,
        failed_message: &str,
        reason: &str,
        history: &ConversationLog,
    ) -> Result<String> {
        let input = format!(
            "AGENT: {}\nROLE: {}\n\nCONVERSATION:\n{}\nFAILED REPLY:\n{}\n\nWHY IT FAILED:\n{}",
            agent.name,
            agent.role_description,
            history.transcript(),
            failed_message,
            reason
        );
        let text = self
            .llm
            .complete_text(TextRequest {
                system: RETRY_PROMPT,
                history: &[],
                input: &input,
                model: &self.model,
            })
            .await?;
        let text = text.trim();
        debug!("Retry prompt for '{}': {} chars", agent.name, text.len());
        if text.is_empty() {
            Ok(fallback_retry_prompt(reason))
        } else {
            Ok(text.to_string())
        }
    }
}

/// Used when no model-written instruction is available
pub fn fallback_retry_prompt(reason: &str) -> String {
    format!(
        "Your previous reply did not complete the task ({}). Please try again and address that problem directly.",
        reason.trim()
    )
}
