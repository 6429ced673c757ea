//! Note-taking on conversations that need further analysis

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::conversation::ConversationLog;
use crate::llm::{LanguageModel, TextRequest};
use crate::team::{ModelArgs, Team};

/// Sentinel the model answers with when nothing is worth writing down
pub const NO_NOTES: &str = "NO NOTES";

const NOTES_PROMPT: &str = "\
You keep working notes for an AI agent team. Read the conversation and write short, concrete \
notes about what the agents should do differently or remember next time. One note per line. \
If there is nothing worth noting, answer exactly: NO NOTES";

pub struct NoteTaker {
    llm: Arc<dyn LanguageModel>,
    model: ModelArgs,
}

impl NoteTaker {
    pub fn new(llm: Arc<dyn LanguageModel>, model: ModelArgs) -> Self {
        Self { llm, model }
    }

    /// Free-text notes on `history`, or `None` when the model has none
    pub async fn take_notes(&self, history: &ConversationLog, team: &Team) -> Result<Option<String>> {
        let input = format!(
            "TEAM: {}\nOBJECTIVES: {}\n\nCONVERSATION:\n{}",
            team.name,
            team.objectives,
            history.transcript()
        );
        let text = self
            .llm
            .complete_text(TextRequest {
                system: NOTES_PROMPT,
                history: &[],
                input: &input,
                model: &self.model,
            })
            .await?;

        if is_no_notes(&text) {
            debug!("Model had no notes");
            return Ok(None);
        }
        Ok(Some(text.trim().to_string()))
    }
}

/// Empty output or the sentinel, with or without trailing punctuation
pub fn is_no_notes(text: &str) -> bool {
    let trimmed = text
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NO_NOTES)
}
