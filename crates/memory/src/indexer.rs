/// Incremental indexer: memory-directory markdown → chunks (+ embeddings) in the store.
use std::{
    collections::HashSet,
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    tracing::{debug, info, warn},
    walkdir::WalkDir,
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    chunker::chunk_file,
    config::MemoryConfig,
    embedding_cache::embed_batch_cached,
    embeddings::EmbeddingProvider,
    error::Result,
    store::MemoryStore,
    types::FileIndexEntry,
};

/// Result of indexing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed {
        chunks: usize,
        cache_hits: usize,
        cache_misses: usize,
    },
    /// The stored modification time is at least as new as the file's.
    Unchanged,
}

/// Totals for an `index_all` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub errors: usize,
    pub chunks: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl IndexReport {
    fn record(&mut self, outcome: IndexOutcome) {
        match outcome {
            IndexOutcome::Indexed {
                chunks,
                cache_hits,
                cache_misses,
            } => {
                self.indexed += 1;
                self.chunks += chunks;
                self.cache_hits += cache_hits;
                self.cache_misses += cache_misses;
            },
            IndexOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn MemoryStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    config: Arc<MemoryConfig>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: Arc<MemoryConfig>,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Re-chunk `rel_path` (relative to `project_dir`) unless its modification
    /// time is unchanged since the last pass.
    pub async fn index_file(&self, project_dir: &Path, rel_path: &str) -> Result<IndexOutcome> {
        let abs = project_dir.join(rel_path);
        let metadata = tokio::fs::metadata(&abs).await?;
        let modified = unix_millis(metadata.modified()?);

        if let Some(entry) = self.store.get_file(rel_path).await?
            && entry.last_modified >= modified
        {
            debug!(path = rel_path, "file unchanged, skipping");
            return Ok(IndexOutcome::Unchanged);
        }

        let content = tokio::fs::read_to_string(&abs).await?;
        let mut chunks = chunk_file(rel_path, &content, &self.config.chunk);

        let (mut cache_hits, mut cache_misses) = (0, 0);
        if let Some(provider) = &self.provider
            && !chunks.is_empty()
        {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match embed_batch_cached(
                self.store.as_ref(),
                provider.as_ref(),
                &texts,
                self.config.embedding.timeout,
            )
            .await
            {
                Ok(batch) => {
                    cache_hits = batch.cache_hits;
                    cache_misses = batch.cache_misses;
                    for (chunk, vector) in chunks.iter_mut().zip(batch.vectors) {
                        chunk.embedding = (!vector.is_empty()).then_some(vector);
                    }
                },
                Err(e) => {
                    warn!(path = rel_path, error = %e, "embedding failed, indexing text only");
                },
            }
        }

        let entry = FileIndexEntry {
            path: rel_path.to_string(),
            last_modified: modified,
            chunk_count: chunks.len(),
            last_indexed: unix_millis(SystemTime::now()),
        };
        self.store.replace_chunks(&entry, &chunks).await?;

        #[cfg(feature = "metrics")]
        counter!("mnemo_memory_files_indexed_total").increment(1);

        info!(path = rel_path, chunks = chunks.len(), "indexed file");
        Ok(IndexOutcome::Indexed {
            chunks: chunks.len(),
            cache_hits,
            cache_misses,
        })
    }

    /// Index every markdown file directly inside the memory directory and
    /// forget tracked files that no longer exist.
    pub async fn index_all(&self, project_dir: &Path) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let memory_dir = self.config.memory_dir(project_dir);
        let mut seen = HashSet::new();

        if memory_dir.is_dir() {
            let walker = WalkDir::new(&memory_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name();
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(dir = %memory_dir.display(), error = %e, "failed to read memory directory entry");
                        report.errors += 1;
                        continue;
                    },
                };
                if !entry.file_type().is_file() || !is_markdown(entry.path()) {
                    continue;
                }
                let Some(name) = entry.file_name().to_str() else {
                    warn!(path = %entry.path().display(), "skipping non-UTF-8 file name");
                    continue;
                };
                let rel = self.config.relative_memory_path(name);
                seen.insert(rel.clone());

                match self.index_file(project_dir, &rel).await {
                    Ok(outcome) => report.record(outcome),
                    Err(e) => {
                        warn!(path = %rel, error = %e, "failed to index file");
                        report.errors += 1;
                    },
                }
            }
        } else {
            debug!(dir = %memory_dir.display(), "memory directory does not exist");
        }

        for file in self.store.list_files().await? {
            if seen.contains(&file.path) || project_dir.join(&file.path).exists() {
                continue;
            }
            info!(path = %file.path, "removing vanished file from index");
            if self.store.remove_file(&file.path).await? {
                report.removed += 1;
            }
        }

        self.evict_cache().await;
        Ok(report)
    }

    /// Stop tracking `rel_path`. Returns whether it was tracked.
    pub async fn remove_file(&self, rel_path: &str) -> Result<bool> {
        self.store.remove_file(rel_path).await
    }

    async fn evict_cache(&self) {
        let max_rows = self.config.cache_max_rows;
        match self.store.count_cached_embeddings().await {
            Ok(n) if n > max_rows => match self.store.evict_embedding_cache(max_rows).await {
                Ok(evicted) => debug!(evicted, max_rows, "evicted embedding cache rows"),
                Err(e) => warn!(error = %e, "embedding cache eviction failed"),
            },
            Ok(_) => {},
            Err(e) => warn!(error = %e, "failed to count embedding cache rows"),
        }
    }
}

pub(crate) fn is_markdown(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("md")
}

fn unix_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
