/// Cache-first embedding: content hash + provider id + model name keys every vector.
use std::time::Duration;

use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    embeddings::{EmbeddingProvider, with_timeout},
    error::{Error, Result},
    store::MemoryStore,
    types::content_hash,
};

/// Embed `text`, serving it from the cache when the same provider and model
/// already produced a vector for identical content.
pub async fn embed_and_cache(
    store: &dyn MemoryStore,
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let hash = content_hash(text);
    if let Some(cached) = lookup(store, provider, &hash).await {
        record_cache(true, 1);
        return Ok(cached);
    }
    record_cache(false, 1);

    let embedding = with_timeout(timeout, provider.embed_query(text)).await?;
    store_best_effort(store, provider, &hash, &embedding).await;
    Ok(embedding)
}

/// Vectors for a batch of texts plus how many came from the cache.
#[derive(Debug, Default)]
pub struct BatchEmbeddings {
    pub vectors: Vec<Vec<f32>>,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Embed many texts with a single provider call covering only the cache misses.
pub async fn embed_batch_cached(
    store: &dyn MemoryStore,
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    timeout: Duration,
) -> Result<BatchEmbeddings> {
    let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
    let mut missing = Vec::new();

    for (i, hash) in hashes.iter().enumerate() {
        let cached = lookup(store, provider, hash).await;
        if cached.is_none() {
            missing.push(i);
        }
        vectors.push(cached);
    }

    let cache_hits = texts.len() - missing.len();
    record_cache(true, cache_hits);
    record_cache(false, missing.len());

    if !missing.is_empty() {
        let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
        let fresh = with_timeout(timeout, provider.embed_batch(&batch)).await?;
        if fresh.len() != batch.len() {
            return Err(Error::Embedding(format!(
                "provider returned {} vectors for {} texts",
                fresh.len(),
                batch.len()
            )));
        }
        for (&i, embedding) in missing.iter().zip(fresh) {
            store_best_effort(store, provider, &hashes[i], &embedding).await;
            vectors[i] = Some(embedding);
        }
    }

    Ok(BatchEmbeddings {
        vectors: vectors.into_iter().map(Option::unwrap_or_default).collect(),
        cache_hits,
        cache_misses: missing.len(),
    })
}

/// Embed up to `limit` memories that have no vector yet, in one batch call.
/// Returns how many memories were updated.
pub async fn backfill_embeddings(
    store: &dyn MemoryStore,
    provider: &dyn EmbeddingProvider,
    project_dir: &str,
    session_id: Option<&str>,
    limit: usize,
    timeout: Duration,
) -> Result<usize> {
    let pending = store
        .unembedded_memories(project_dir, session_id, limit)
        .await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = pending.iter().map(|p| p.content.clone()).collect();
    let embeddings = with_timeout(timeout, provider.embed_batch(&texts)).await?;
    if embeddings.len() != pending.len() {
        return Err(Error::Embedding(format!(
            "provider returned {} vectors for {} memories",
            embeddings.len(),
            pending.len()
        )));
    }

    let mut updated = 0;
    for (memory, embedding) in pending.iter().zip(embeddings) {
        if embedding.is_empty() {
            continue;
        }
        if let Err(e) = store.update_memory_embedding(&memory.id, &embedding).await {
            warn!(id = %memory.id, error = %e, "failed to store memory embedding");
            continue;
        }
        store_best_effort(store, provider, &content_hash(&memory.content), &embedding).await;
        updated += 1;
    }
    debug!(project = project_dir, updated, "backfilled memory embeddings");
    Ok(updated)
}

async fn lookup(
    store: &dyn MemoryStore,
    provider: &dyn EmbeddingProvider,
    hash: &str,
) -> Option<Vec<f32>> {
    match store
        .cached_embedding(hash, provider.id(), provider.model())
        .await
    {
        Ok(Some(v)) if !v.is_empty() => Some(v),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "embedding cache lookup failed");
            None
        },
    }
}

async fn store_best_effort(
    store: &dyn MemoryStore,
    provider: &dyn EmbeddingProvider,
    hash: &str,
    embedding: &[f32],
) {
    if embedding.is_empty() {
        return;
    }
    if let Err(e) = store
        .cache_embedding(hash, provider.id(), provider.model(), embedding)
        .await
    {
        warn!(error = %e, "failed to write embedding cache entry");
    }
}

#[cfg(feature = "metrics")]
fn record_cache(hit: bool, n: usize) {
    if n == 0 {
        return;
    }
    let name = if hit {
        "mnemo_memory_embedding_cache_hits_total"
    } else {
        "mnemo_memory_embedding_cache_misses_total"
    };
    counter!(name).increment(n as u64);
}

#[cfg(not(feature = "metrics"))]
fn record_cache(_hit: bool, _n: usize) {}
