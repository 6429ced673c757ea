//! Long-term memory and agent notes

use anyhow::{Context, Result};
use async_trait::async_trait;
use conclave_knowledge::KnowledgeDb;
use tracing::debug;

use crate::conversation::ConversationLog;
use crate::team::AgentDefinition;

/// Persists memory-worthy exchanges
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store_memory(
        &self,
        history: &ConversationLog,
        participants: &[AgentDefinition],
        user_id: &str,
    ) -> Result<()>;
}

/// Per-agent notes gathered during analysis
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn store_note(&self, agent_name: &str, note: &str) -> Result<()>;

    async fn notes_for(&self, agent_name: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl MemoryStore for KnowledgeDb {
    async fn store_memory(
        &self,
        history: &ConversationLog,
        participants: &[AgentDefinition],
        user_id: &str,
    ) -> Result<()> {
        let names: Vec<String> = participants.iter().map(|a| a.name.clone()).collect();
        let transcript =
            serde_json::to_value(history.messages()).context("Failed to serialise history")?;
        let id = self.insert_memory(user_id, &names, transcript).await?;
        debug!("Stored memory {} ({} participants)", id, names.len());
        Ok(())
    }
}

#[async_trait]
impl NoteStore for KnowledgeDb {
    async fn store_note(&self, agent_name: &str, note: &str) -> Result<()> {
        self.insert_note(agent_name, note).await?;
        Ok(())
    }

    async fn notes_for(&self, agent_name: &str) -> Result<Vec<String>> {
        Ok(self
            .get_notes(agent_name)
            .await?
            .into_iter()
            .map(|n| n.note)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::model;

    #[tokio::test]
    async fn test_knowledge_db_memory_store() {
        let db = KnowledgeDb::in_memory().unwrap();
        let mut log = ConversationLog::new();
        log.append_turn("Critic", "review", "approved");
        let agents = vec![AgentDefinition::new("Critic", model())];

        db.store_memory(&log, &agents, "user-1").await.unwrap();

        let memories = db.get_memories("user-1", 10).await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].participants, vec!["Critic".to_string()]);
        assert_eq!(memories[0].transcript[1]["content"], "approved");
    }

    #[tokio::test]
    async fn test_knowledge_db_note_store() {
        let db = KnowledgeDb::in_memory().unwrap();
        db.store_note("Critic", "Prefers bullet points").await.unwrap();
        db.store_note("Critic", "Flags passive voice").await.unwrap();
        let notes = db.notes_for("Critic").await.unwrap();
        assert_eq!(notes, vec!["Prefers bullet points", "Flags passive voice"]);
        assert!(db.notes_for("Scribe").await.unwrap().is_empty());
    }
}
