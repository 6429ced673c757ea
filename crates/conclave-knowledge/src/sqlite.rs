//! SQLite database layer for team snapshots, memories, notes and vector chunks

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generic key/value entry, scoped by namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A memory-worthy exchange persisted for later recall
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub participants: Vec<String>,
    pub transcript: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Free-text note an agent accumulated from past conversations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNote {
    pub id: String,
    pub agent_name: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Embedded text chunk to be stored in a namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChunk {
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// A stored chunk returned from a similarity query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub id: String,
    pub namespace: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
    pub score: f32,
}

/// SQLite database wrapper (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct KnowledgeDb {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("Database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

fn json_column(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<JsonValue>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl KnowledgeDb {
    /// Initialize database with schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Initializing knowledge database at {:?}", path.as_ref());
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a throwaway in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(namespace, key)
            );
            CREATE INDEX IF NOT EXISTS idx_kv_namespace ON kv_entries(namespace, updated_at);

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                participants TEXT NOT NULL,
                transcript TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id, created_at);

            CREATE TABLE IF NOT EXISTS agent_notes (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL COLLATE NOCASE,
                note TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notes_agent ON agent_notes(agent_name);

            CREATE TABLE IF NOT EXISTS vector_chunks (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_namespace ON vector_chunks(namespace);",
        )
        .context("Failed to create knowledge schema")?;
        Ok(())
    }

    // ── key/value store ──

    /// Store `value` under `key` in `namespace`, replacing any previous value
    pub async fn put(&self, value: JsonValue, key: &str, namespace: &str) -> Result<String> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_owned();
        let namespace = namespace.to_owned();

        tokio::task::spawn_blocking(move || {
            let now = timestamp(Utc::now());
            let value_json = serde_json::to_string(&value)?;
            let conn = lock(&conn);

            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    params![&namespace, &key],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE kv_entries SET value = ?1, updated_at = ?2 WHERE id = ?3",
                        params![value_json, now, &id],
                    )?;
                    id
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO kv_entries (id, namespace, key, value, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        params![&id, &namespace, &key, value_json, now],
                    )?;
                    id
                }
            };

            debug!("Stored {}/{} ({})", namespace, key, id);
            Ok(id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// All entries in a namespace, most recently written first
    pub async fn get_many(&self, namespace: &str) -> Result<Vec<KvEntry>> {
        self.query_namespace(namespace, None).await
    }

    /// The `n` most recently written entries in a namespace
    pub async fn get_last(&self, n: usize, namespace: &str) -> Result<Vec<KvEntry>> {
        self.query_namespace(namespace, Some(n)).await
    }

    /// The most recently written entry in a namespace
    pub async fn get_single(&self, namespace: &str) -> Result<Option<KvEntry>> {
        Ok(self.query_namespace(namespace, Some(1)).await?.into_iter().next())
    }

    /// Delete an entry by id. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let removed = conn.execute("DELETE FROM kv_entries WHERE id = ?1", params![&id])?;
            Ok(removed > 0)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn query_namespace(&self, namespace: &str, limit: Option<usize>) -> Result<Vec<KvEntry>> {
        let conn = Arc::clone(&self.conn);
        let namespace = namespace.to_owned();
        let limit = limit.map(|n| n as i64).unwrap_or(-1);

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(
                "SELECT id, namespace, key, value, created_at, updated_at
                 FROM kv_entries WHERE namespace = ?1
                 ORDER BY updated_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![&namespace, limit], Self::row_to_kv)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    fn row_to_kv(row: &rusqlite::Row) -> rusqlite::Result<KvEntry> {
        let value = json_column(3, Some(row.get(3)?))?.unwrap_or(JsonValue::Null);
        Ok(KvEntry {
            id: row.get(0)?,
            namespace: row.get(1)?,
            key: row.get(2)?,
            value,
            created_at: parse_timestamp(row.get(4)?),
            updated_at: parse_timestamp(row.get(5)?),
        })
    }

    // ── long-term memories ──

    /// Persist a memory-worthy exchange
    pub async fn insert_memory(
        &self,
        user_id: &str,
        participants: &[String],
        transcript: JsonValue,
    ) -> Result<String> {
        let conn = Arc::clone(&self.conn);
        let user_id = user_id.to_owned();
        let participants = serde_json::to_string(participants)?;

        tokio::task::spawn_blocking(move || {
            let id = Uuid::new_v4().to_string();
            let transcript = serde_json::to_string(&transcript)?;
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO memories (id, user_id, participants, transcript, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![&id, &user_id, participants, transcript, timestamp(Utc::now())],
            )?;
            debug!("Inserted memory {} for user {}", id, user_id);
            Ok(id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// Most recent memories for a user
    pub async fn get_memories(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = Arc::clone(&self.conn);
        let user_id = user_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(
                "SELECT id, user_id, participants, transcript, created_at
                 FROM memories WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let memories = stmt
                .query_map(params![&user_id, limit as i64], |row| {
                    let participants = json_column(2, Some(row.get(2)?))?
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    Ok(MemoryRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        participants,
                        transcript: json_column(3, Some(row.get(3)?))?.unwrap_or(JsonValue::Null),
                        created_at: parse_timestamp(row.get(4)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(memories)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    // ── agent notes ──

    pub async fn insert_note(&self, agent_name: &str, note: &str) -> Result<String> {
        let conn = Arc::clone(&self.conn);
        let agent_name = agent_name.to_owned();
        let note = note.to_owned();

        tokio::task::spawn_blocking(move || {
            let id = Uuid::new_v4().to_string();
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO agent_notes (id, agent_name, note, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![&id, &agent_name, &note, timestamp(Utc::now())],
            )?;
            Ok(id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// Notes for an agent (name matched case-insensitively), oldest first
    pub async fn get_notes(&self, agent_name: &str) -> Result<Vec<AgentNote>> {
        let conn = Arc::clone(&self.conn);
        let agent_name = agent_name.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(
                "SELECT id, agent_name, note, created_at FROM agent_notes
                 WHERE agent_name = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let notes = stmt
                .query_map(params![&agent_name], |row| {
                    Ok(AgentNote {
                        id: row.get(0)?,
                        agent_name: row.get(1)?,
                        note: row.get(2)?,
                        created_at: parse_timestamp(row.get(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(notes)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    // ── vector chunks ──

    /// Store embedded chunks in a namespace. Returns the new chunk ids.
    pub async fn store_chunks(&self, namespace: &str, chunks: Vec<NewChunk>) -> Result<Vec<String>> {
        let conn = Arc::clone(&self.conn);
        let namespace = namespace.to_owned();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn);
            let tx = conn.transaction()?;
            let now = timestamp(Utc::now());
            let mut ids = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                if chunk.embedding.is_empty() {
                    return Err(anyhow!("Refusing to store chunk with empty embedding"));
                }
                let id = Uuid::new_v4().to_string();
                let metadata = chunk.metadata.map(|m| serde_json::to_string(&m)).transpose()?;
                tx.execute(
                    "INSERT INTO vector_chunks (id, namespace, content, embedding, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        &id,
                        &namespace,
                        &chunk.content,
                        serde_json::to_string(&chunk.embedding)?,
                        metadata,
                        &now,
                    ],
                )?;
                ids.push(id);
            }
            tx.commit()?;
            debug!("Stored {} chunks in namespace {}", ids.len(), namespace);
            Ok(ids)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// Top-k chunks in a namespace by cosine similarity to `embedding`
    pub async fn query_chunks(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let conn = Arc::clone(&self.conn);
        let namespace = namespace.to_owned();
        let query = embedding.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(
                "SELECT id, namespace, content, embedding, metadata FROM vector_chunks WHERE namespace = ?1",
            )?;
            let rows = stmt
                .query_map(params![&namespace], |row| {
                    let raw: String = row.get(3)?;
                    let stored: Vec<f32> = serde_json::from_str(&raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                    Ok(ChunkMatch {
                        id: row.get(0)?,
                        namespace: row.get(1)?,
                        content: row.get(2)?,
                        metadata: json_column(4, row.get(4)?)?,
                        score: cosine_similarity(&query, &stored),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut matches = rows;
            matches.sort_by(|a, b| b.score.total_cmp(&a.score));
            matches.truncate(top_k);
            Ok(matches)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// Remove every chunk in a namespace. Returns the number removed.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let namespace = namespace.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let removed = conn.execute(
                "DELETE FROM vector_chunks WHERE namespace = ?1",
                params![&namespace],
            )?;
            info!("Deleted {} chunks from namespace {}", removed, namespace);
            Ok(removed)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

/// Cosine similarity; mismatched or zero-length vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> Result<(tempfile::TempDir, KnowledgeDb)> {
        let dir = tempfile::tempdir()?;
        let db = KnowledgeDb::new(dir.path().join("knowledge.db"))?;
        Ok((dir, db))
    }

    #[tokio::test]
    async fn test_kv_put_and_get() -> Result<()> {
        let (_dir, db) = temp_db()?;

        let id = db.put(json!({"model": "gpt-4o"}), "model", "prefs").await?;
        assert!(!id.is_empty());

        let single = db.get_single("prefs").await?.unwrap();
        assert_eq!(single.key, "model");
        assert_eq!(single.value["model"], "gpt-4o");

        // Same key in the same namespace overwrites in place
        let id2 = db.put(json!({"model": "claude"}), "model", "prefs").await?;
        assert_eq!(id, id2);
        let many = db.get_many("prefs").await?;
        assert_eq!(many.len(), 1);
        assert_eq!(many[0].value["model"], "claude");
        Ok(())
    }

    #[tokio::test]
    async fn test_kv_get_last_orders_by_recency() -> Result<()> {
        let (_dir, db) = temp_db()?;
        db.put(json!(1), "a", "prompts").await?;
        db.put(json!(2), "b", "prompts").await?;
        db.put(json!(3), "c", "prompts").await?;
        db.put(json!("other"), "x", "elsewhere").await?;

        let last = db.get_last(2, "prompts").await?;
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].key, "c");
        assert_eq!(last[1].key, "b");

        assert_eq!(db.get_many("prompts").await?.len(), 3);
        assert!(db.get_single("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_kv_delete() -> Result<()> {
        let (_dir, db) = temp_db()?;
        let id = db.put(json!("hello"), "greeting", "prompts").await?;
        assert!(db.delete(&id).await?);
        assert!(!db.delete(&id).await?);
        assert!(db.get_many("prompts").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_operations() -> Result<()> {
        let db = KnowledgeDb::in_memory()?;
        let participants = vec!["Scribe".to_string(), "Critic".to_string()];
        db.insert_memory("user-1", &participants, json!([{"role": "user", "content": "hi"}]))
            .await?;
        db.insert_memory("user-2", &[], json!([])).await?;

        let memories = db.get_memories("user-1", 10).await?;
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].participants, participants);
        assert_eq!(memories[0].transcript[0]["content"], "hi");
        Ok(())
    }

    #[tokio::test]
    async fn test_notes_match_agent_case_insensitively() -> Result<()> {
        let db = KnowledgeDb::in_memory()?;
        db.insert_note("ScriptMaster", "prefers bullet lists").await?;
        db.insert_note("scriptmaster", "answers in English").await?;
        db.insert_note("Critic", "unrelated").await?;

        let notes = db.get_notes("SCRIPTMASTER").await?;
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, "prefers bullet lists");
        Ok(())
    }

    #[tokio::test]
    async fn test_vector_store_query_and_delete() -> Result<()> {
        let db = KnowledgeDb::in_memory()?;
        db.store_chunks(
            "kb",
            vec![
                NewChunk {
                    content: "rust ownership".to_string(),
                    embedding: vec![1.0, 0.0],
                    metadata: Some(json!({"source": "book.md"})),
                },
                NewChunk {
                    content: "gardening".to_string(),
                    embedding: vec![0.0, 1.0],
                    metadata: None,
                },
            ],
        )
        .await?;

        let hits = db.query_chunks("kb", &[0.9, 0.1], 1).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "rust ownership");
        assert_eq!(hits[0].metadata.as_ref().unwrap()["source"], "book.md");

        assert!(db.query_chunks("other", &[1.0, 0.0], 5).await?.is_empty());
        assert_eq!(db.delete_namespace("kb").await?, 2);
        assert!(db.query_chunks("kb", &[1.0, 0.0], 5).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_rejects_empty_embedding() -> Result<()> {
        let db = KnowledgeDb::in_memory()?;
        let result = db
            .store_chunks(
                "kb",
                vec![NewChunk {
                    content: "x".to_string(),
                    embedding: vec![],
                    metadata: None,
                }],
            )
            .await;
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
