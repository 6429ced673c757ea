//! Agent knowledge bases backed by the vector store

use anyhow::{Context, Result};
use async_trait::async_trait;
use conclave_knowledge::{KnowledgeDb, NewChunk};
use std::sync::Arc;
use tracing::{debug, info};

use crate::context_sets::ContextSet;
use crate::providers::Embedder;

/// Supplies per-turn reference material for an agent's knowledge base
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// `None` when nothing in `namespace` is relevant to `query`
    async fn retrieve(&self, namespace: &str, query: &str) -> Result<Option<ContextSet>>;
}

/// Embeds the query and pulls the nearest chunks from `KnowledgeDb`
pub struct VectorKnowledgeRetriever {
    embedder: Arc<dyn Embedder>,
    db: KnowledgeDb,
    top_k: usize,
    min_score: f32,
}

impl VectorKnowledgeRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, db: KnowledgeDb, top_k: usize) -> Self {
        Self {
            embedder,
            db,
            top_k: top_k.max(1),
            min_score: 0.0,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Split `text` into chunks, embed them and store them under `namespace`.
    /// Returns the number of chunks stored.
    pub async fn ingest(&self, namespace: &str, text: &str, max_chunk_chars: usize) -> Result<usize> {
        let chunks = chunk_text(text, max_chunk_chars);
        if chunks.is_empty() {
            return Ok(0);
        }
        let embeddings = self
            .embedder
            .embed(&chunks)
            .await
            .context("Failed to embed knowledge chunks")?;
        anyhow::ensure!(
            embeddings.len() == chunks.len(),
            "Embedder returned {} vectors for {} chunks",
            embeddings.len(),
            chunks.len()
        );

        let new_chunks = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (content, embedding))| NewChunk {
                content,
                embedding,
                metadata: Some(serde_json::json!({ "position": i })),
            })
            .collect();
        let ids = self.db.store_chunks(namespace, new_chunks).await?;
        info!("Ingested {} chunks into knowledge base '{}'", ids.len(), namespace);
        Ok(ids.len())
    }
}

#[async_trait]
impl KnowledgeRetriever for VectorKnowledgeRetriever {
    async fn retrieve(&self, namespace: &str, query: &str) -> Result<Option<ContextSet>> {
        if query.trim().is_empty() {
            return Ok(None);
        }
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let Some(vector) = vectors.into_iter().next() else {
            return Ok(None);
        };

        let matches = self.db.query_chunks(namespace, &vector, self.top_k).await?;
        let lines: Vec<String> = matches
            .into_iter()
            .filter(|m| m.score >= self.min_score)
            .map(|m| m.content)
            .collect();
        debug!(
            "Knowledge base '{}': {} chunks above {:.2}",
            namespace,
            lines.len(),
            self.min_score
        );

        if lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ContextSet::new(format!("Knowledge base: {}", namespace), lines)))
        }
    }
}

/// Paragraph-aligned chunks of at most `max_chars` characters. Paragraphs
/// longer than the limit are split on character boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let candidate_len = if current.is_empty() {
            paragraph.chars().count()
        } else {
            current.chars().count() + 2 + paragraph.chars().count()
        };

        if candidate_len <= max_chars {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if paragraph.chars().count() <= max_chars {
            current.push_str(paragraph);
        } else {
            let chars: Vec<char> = paragraph.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
