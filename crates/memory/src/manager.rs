/// Memory manager: one project's store, indexer, search and daily logs behind one handle.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    chrono::Local,
    serde::Serialize,
    tracing::{debug, info, warn},
};

#[cfg(feature = "file-watcher")]
use crate::watcher::{self, WatcherHandle};
use crate::{
    config::MemoryConfig,
    daily_log::{self, DailyLogEntry},
    embedding_cache,
    embeddings::EmbeddingProvider,
    error::Result,
    indexer::{IndexOutcome, IndexReport, Indexer},
    search::{HybridSearch, Scored, SearchQuery},
    store::MemoryStore,
    store_sqlite::SqliteMemoryStore,
    types::{Chunk, GcOptions, GcReport, Memory, MemoryStats, MemoryType},
};

pub struct MemoryManager {
    project_dir: PathBuf,
    /// Scope key stored on every memory of this project.
    project_key: String,
    config: Arc<MemoryConfig>,
    store: Arc<dyn MemoryStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    indexer: Indexer,
}

/// Status info about the memory system.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    #[serde(flatten)]
    pub stats: MemoryStats,
    pub cached_embeddings: usize,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
}

impl MemoryManager {
    /// Open (creating if needed) the project's database under its state
    /// directory and wire up the indexer.
    pub async fn open(
        project_dir: &Path,
        config: MemoryConfig,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.memory_dir(project_dir)).await?;
        let store = SqliteMemoryStore::open(&config.db_path(project_dir)).await?;
        info!(
            project = %project_dir.display(),
            provider = provider.as_ref().map(|p| p.id()).unwrap_or("none"),
            "opened memory store"
        );
        Ok(Self::with_store(
            project_dir,
            config,
            Arc::new(store),
            provider,
        ))
    }

    pub fn with_store(
        project_dir: &Path,
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let config = Arc::new(config);
        let indexer = Indexer::new(Arc::clone(&store), provider.clone(), Arc::clone(&config));
        Self {
            project_dir: project_dir.to_path_buf(),
            project_key: project_dir.to_string_lossy().into_owned(),
            config,
            store,
            provider,
            indexer,
        }
    }

    pub fn store(&self) -> &dyn MemoryStore {
        self.store.as_ref()
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn project_key(&self) -> &str {
        &self.project_key
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// A query scoped to this project.
    pub fn query(&self, text: impl Into<String>) -> SearchQuery {
        SearchQuery::new(self.project_key.clone(), text)
    }

    /// A new memory scoped to this project.
    pub fn new_memory(
        &self,
        session_id: impl Into<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
    ) -> Memory {
        Memory::new(session_id, self.project_key.clone(), memory_type, content)
    }

    // ── Indexing ────────────────────────────────────────────────────────

    pub async fn index_all(&self) -> Result<IndexReport> {
        let report = self.indexer.index_all(&self.project_dir).await?;
        debug!(?report, "index pass complete");
        Ok(report)
    }

    pub async fn index_file(&self, rel_path: &str) -> Result<IndexOutcome> {
        self.indexer.index_file(&self.project_dir, rel_path).await
    }

    pub async fn remove_file(&self, rel_path: &str) -> Result<bool> {
        self.indexer.remove_file(rel_path).await
    }

    /// Watch the memory directory and re-index files as they change.
    #[cfg(feature = "file-watcher")]
    pub fn watch(&self) -> Result<WatcherHandle> {
        watcher::watch(self.indexer.clone(), &self.project_dir, &self.config)
    }

    // ── Search ──────────────────────────────────────────────────────────

    fn engine(&self) -> HybridSearch<'_> {
        HybridSearch::new(self.store.as_ref(), &self.config.search)
            .with_provider(self.provider.as_deref(), self.config.embedding.timeout)
    }

    /// Hybrid search over indexed markdown chunks.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Scored<Chunk>>> {
        self.engine()
            .search_chunks(&self.query(query).with_limit(limit))
            .await
    }

    /// Lexical search over memory records.
    pub async fn search_memories(&self, query: &SearchQuery) -> Result<Vec<Scored<Memory>>> {
        self.engine().search_memories(query).await
    }

    /// Lexical plus vector search over memory records.
    pub async fn search_memories_hybrid(
        &self,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<Memory>>> {
        self.engine().search_memories_hybrid(query).await
    }

    // ── Memories ────────────────────────────────────────────────────────

    pub async fn save_memory(&self, memory: &Memory) -> Result<()> {
        self.store.save(memory).await
    }

    /// Returns `false` when the project already holds the same content.
    pub async fn save_if_new(&self, memory: &Memory) -> Result<bool> {
        self.store.save_if_new(memory).await
    }

    /// Append to today's daily log (local time). Returns the project-relative path.
    pub async fn append_daily_log(&self, entry: &DailyLogEntry) -> Result<String> {
        daily_log::append_daily_log(
            &self.project_dir,
            &self.config,
            entry,
            Local::now().naive_local(),
        )
        .await
    }

    pub async fn append_memory_md(&self, section: &str, content: &str) -> Result<String> {
        daily_log::append_memory_md(&self.project_dir, &self.config, section, content).await
    }

    /// Embed memories that have no vector yet. Without a provider this is a no-op.
    pub async fn backfill_embeddings(&self, session_id: Option<&str>) -> Result<usize> {
        let Some(provider) = &self.provider else {
            return Ok(0);
        };
        embedding_cache::backfill_embeddings(
            self.store.as_ref(),
            provider.as_ref(),
            &self.project_key,
            session_id,
            self.config.embedding.backfill_limit,
            self.config.embedding.timeout,
        )
        .await
    }

    /// Garbage-collect memories with `opts` (or the configured policy) and,
    /// unless dry-running, prune stale embedding cache rows.
    pub async fn garbage_collect(&self, opts: Option<&GcOptions>) -> Result<GcReport> {
        let opts = opts.copied().unwrap_or(self.config.gc);
        let report = self.store.garbage_collect(&self.project_key, &opts).await?;
        if !opts.dry_run {
            match self
                .store
                .prune_embedding_cache(self.config.cache_max_age)
                .await
            {
                Ok(0) => {},
                Ok(pruned) => debug!(pruned, "pruned embedding cache"),
                Err(e) => warn!(error = %e, "embedding cache prune failed"),
            }
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        Ok(MemoryStatus {
            stats: self.store.stats(&self.project_key).await?,
            cached_embeddings: self.store.count_cached_embeddings().await?,
            embedding_provider: self.provider.as_ref().map(|p| p.id().to_string()),
            embedding_model: self.provider.as_ref().map(|p| p.model().to_string()),
        })
    }
}
