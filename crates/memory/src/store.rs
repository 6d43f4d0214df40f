/// Storage seam: everything the indexer, search engine and manager need from persistence.
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::Result,
    search::{Scored, SearchQuery},
    types::{
        Chunk, FileIndexEntry, GcOptions, GcReport, Memory, MemoryStats, ProjectKnowledge,
        SessionRecord,
    },
};

/// A memory awaiting its embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEmbedding {
    pub id: String,
    pub content: String,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    // ---- memories ----

    /// Insert or replace a memory, keeping the full-text index in step.
    async fn save(&self, memory: &Memory) -> Result<()>;
    /// Insert unless the project already holds the same content hash.
    /// Returns `false` for a duplicate.
    async fn save_if_new(&self, memory: &Memory) -> Result<bool>;
    /// Exact ID first, then the most recent memory whose ID starts with `id_or_prefix`.
    async fn get(&self, id_or_prefix: &str) -> Result<Memory>;
    async fn delete(&self, id: &str) -> Result<bool>;
    /// Newest first.
    async fn list_recent(&self, project_dir: &str, limit: usize) -> Result<Vec<Memory>>;
    /// Oldest first.
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<Memory>>;
    async fn delete_by_session(&self, session_id: &str) -> Result<usize>;
    async fn update_memory_embedding(&self, id: &str, embedding: &[f32]) -> Result<()>;
    async fn unembedded_memories(
        &self,
        project_dir: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PendingEmbedding>>;
    /// Bump `access_count` and refresh `accessed_at`.
    async fn record_access(&self, ids: &[String]) -> Result<()>;
    async fn garbage_collect(&self, project_dir: &str, opts: &GcOptions) -> Result<GcReport>;

    // ---- sessions & knowledge ----

    async fn save_session(&self, session: &SessionRecord) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    async fn last_session(&self, project_dir: &str) -> Result<Option<SessionRecord>>;
    async fn sessions_for_project(
        &self,
        project_dir: &str,
        limit: usize,
    ) -> Result<Vec<SessionRecord>>;
    /// Upsert; returns the knowledge ID (generated when empty).
    async fn save_knowledge(&self, knowledge: &ProjectKnowledge) -> Result<String>;
    async fn project_knowledge(&self, project_dir: &str) -> Result<Vec<ProjectKnowledge>>;

    // ---- files & chunks ----

    async fn get_file(&self, path: &str) -> Result<Option<FileIndexEntry>>;
    async fn list_files(&self) -> Result<Vec<FileIndexEntry>>;
    /// Delete every chunk of `entry.path`, insert `chunks` and upsert `entry`
    /// in one transaction.
    async fn replace_chunks(&self, entry: &FileIndexEntry, chunks: &[Chunk]) -> Result<()>;
    async fn chunks_for_file(&self, path: &str) -> Result<Vec<Chunk>>;
    /// Drop a file's chunks and index entry. Returns whether it was tracked.
    async fn remove_file(&self, path: &str) -> Result<bool>;

    // ---- embedding cache ----

    async fn cached_embedding(
        &self,
        content_hash: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>>;
    async fn cache_embedding(
        &self,
        content_hash: &str,
        provider: &str,
        model: &str,
        embedding: &[f32],
    ) -> Result<()>;
    /// Remove entries created more than `max_age` ago.
    async fn prune_embedding_cache(&self, max_age: Duration) -> Result<usize>;
    async fn count_cached_embeddings(&self) -> Result<usize>;
    /// Keep the `keep` most recent entries.
    async fn evict_embedding_cache(&self, keep: usize) -> Result<usize>;

    // ---- search ----

    /// Lexical memory hits in engine rank order, `text_score` filled in.
    async fn search_memories_text(&self, query: &SearchQuery, limit: usize)
    -> Result<Vec<Scored<Memory>>>;
    /// Project (and type) scoped memories that carry an embedding.
    async fn memory_vector_candidates(
        &self,
        query: &SearchQuery,
        scan_limit: usize,
    ) -> Result<Vec<Memory>>;
    async fn search_chunks_text(&self, query: &SearchQuery, limit: usize)
    -> Result<Vec<Scored<Chunk>>>;
    async fn chunk_vector_candidates(&self, scan_limit: usize) -> Result<Vec<Chunk>>;

    async fn stats(&self, project_dir: &str) -> Result<MemoryStats>;
}
