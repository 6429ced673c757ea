//! Persistence layer for conclave
//!
//! This crate provides:
//! - A namespaced key/value store for team snapshots, histories and saved prompts
//! - Long-term memory records for memory-worthy exchanges
//! - Per-agent notes collected by post-message analysis
//! - A namespace-scoped vector store for knowledge-base chunks

pub mod sqlite;

pub use sqlite::{AgentNote, ChunkMatch, KnowledgeDb, KvEntry, MemoryRecord, NewChunk, cosine_similarity};
