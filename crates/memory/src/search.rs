//! Hybrid retrieval: lexical (FTS5 or substring) and brute-force vector search,
//! merged with weighted scores.
//!
//! Per query: without a provider, or when embedding the query fails or times
//! out, only the lexical path runs. Otherwise both paths run and are merged by
//! entity ID with `vector_weight * vector + text_weight * text`.

use std::{collections::BTreeMap, time::Duration};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    embedding_cache::embed_and_cache,
    embeddings::EmbeddingProvider,
    error::Result,
    store::MemoryStore,
    types::{Chunk, Memory, MemoryType},
};

pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.7;
pub const DEFAULT_TEXT_WEIGHT: f64 = 0.3;
pub const DEFAULT_MIN_SCORE: f64 = 0.35;
pub const DEFAULT_MAX_RESULTS: usize = 6;
pub const DEFAULT_VECTOR_SCAN_LIMIT: usize = 1000;
/// Flat text score for substring matches when FTS5 is unavailable.
pub const SUBSTRING_MATCH_SCORE: f64 = 0.5;

/// Ranking knobs. Defaults are the named constants above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchWeights {
    pub vector_weight: f64,
    pub text_weight: f64,
    pub min_score: f64,
    pub max_results: usize,
    /// Upper bound on stored embeddings compared per query.
    pub vector_scan_limit: usize,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            text_weight: DEFAULT_TEXT_WEIGHT,
            min_score: DEFAULT_MIN_SCORE,
            max_results: DEFAULT_MAX_RESULTS,
            vector_scan_limit: DEFAULT_VECTOR_SCAN_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub project_dir: String,
    pub query: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    /// Zero means the configured `max_results`.
    #[serde(default)]
    pub limit: usize,
    /// Overrides the configured threshold. Lexical-only results are only
    /// filtered when this is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
}

impl SearchQuery {
    pub fn new(project_dir: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    fn effective_limit(&self, weights: &SearchWeights) -> usize {
        if self.limit == 0 {
            weights.max_results
        } else {
            self.limit
        }
    }
}

/// A search hit with its per-path score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scored<T> {
    pub item: T,
    pub score: f64,
    pub vector_score: f64,
    pub text_score: f64,
}

impl<T> Scored<T> {
    /// A lexical hit; its final score is its text score until merged.
    pub fn text(item: T, text_score: f64) -> Self {
        Self {
            item,
            score: text_score,
            vector_score: 0.0,
            text_score,
        }
    }
}

/// Identity used to union lexical and vector hits.
pub trait SearchKey {
    type Key: Ord + Clone;

    fn search_key(&self) -> Self::Key;
}

impl SearchKey for Memory {
    type Key = String;

    fn search_key(&self) -> String {
        self.id.clone()
    }
}

impl SearchKey for Chunk {
    type Key = i64;

    fn search_key(&self) -> i64 {
        self.id
    }
}

/// Cosine similarity in `[-1, 1]`; 0 for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

/// Turn free text into an FTS5 expression: every letter/digit run is quoted
/// and the terms are AND-ed. `None` when nothing searchable remains.
pub fn build_fts_query(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let terms: Vec<String> = cleaned
        .split_whitespace()
        .map(|t| format!("\"{t}\""))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" AND "))
}

/// Map an FTS5 bm25 rank (negative, lower is better) onto `(0, 1]`.
pub fn rank_to_score(rank: f64) -> f64 {
    if !rank.is_finite() {
        return 0.0;
    }
    1.0 / (1.0 + rank.abs())
}

/// Union `vector_hits` and `text_hits` by key, weight, threshold, sort and truncate.
///
/// Ties are broken by key so the output is deterministic.
pub fn merge_scored<T: SearchKey>(
    vector_hits: Vec<(T, f64)>,
    text_hits: Vec<Scored<T>>,
    weights: &SearchWeights,
    min_score: f64,
    limit: usize,
) -> Vec<Scored<T>> {
    let mut merged: BTreeMap<T::Key, Scored<T>> = BTreeMap::new();

    for (item, vector_score) in vector_hits {
        merged.insert(item.search_key(), Scored {
            item,
            score: 0.0,
            vector_score,
            text_score: 0.0,
        });
    }
    for hit in text_hits {
        match merged.get_mut(&hit.item.search_key()) {
            Some(existing) => existing.text_score = hit.text_score,
            None => {
                merged.insert(hit.item.search_key(), Scored {
                    item: hit.item,
                    score: 0.0,
                    vector_score: 0.0,
                    text_score: hit.text_score,
                });
            },
        }
    }

    let mut results: Vec<(T::Key, Scored<T>)> = merged
        .into_iter()
        .map(|(key, mut hit)| {
            hit.score = weights.vector_weight * hit.vector_score + weights.text_weight * hit.text_score;
            (key, hit)
        })
        .filter(|(_, hit)| hit.score >= min_score)
        .collect();

    results.sort_by(|(ka, a), (kb, b)| b.score.total_cmp(&a.score).then_with(|| ka.cmp(kb)));
    results.truncate(limit);
    results.into_iter().map(|(_, hit)| hit).collect()
}

/// Runs queries against one store with an optional embedding provider.
pub struct HybridSearch<'a> {
    store: &'a dyn MemoryStore,
    provider: Option<&'a dyn EmbeddingProvider>,
    weights: &'a SearchWeights,
    timeout: Duration,
}

impl<'a> HybridSearch<'a> {
    pub fn new(store: &'a dyn MemoryStore, weights: &'a SearchWeights) -> Self {
        Self {
            store,
            provider: None,
            weights,
            timeout: Duration::from_secs(10),
        }
    }

    /// Enable the vector path. `timeout` bounds the query-embedding call.
    pub fn with_provider(
        mut self,
        provider: Option<&'a dyn EmbeddingProvider>,
        timeout: Duration,
    ) -> Self {
        self.provider = provider;
        self.timeout = timeout;
        self
    }

    /// Lexical search over memories, with access tracking on every hit.
    pub async fn search_memories(&self, query: &SearchQuery) -> Result<Vec<Scored<Memory>>> {
        record_search("lexical");
        let hits = self.memory_text_hits(query).await?;
        Ok(filter_lexical(hits, query.min_score))
    }

    /// Lexical plus vector search over memories. Degrades to
    /// [`search_memories`](Self::search_memories) when no query vector is available.
    pub async fn search_memories_hybrid(
        &self,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<Memory>>> {
        let Some(query_vec) = self.query_embedding(&query.query).await else {
            return self.search_memories(query).await;
        };
        record_search("hybrid");

        let candidates = match self
            .store
            .memory_vector_candidates(query, self.weights.vector_scan_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "vector scan failed, using lexical results only");
                return self.search_memories(query).await;
            },
        };
        let vector_hits = vector_hits(candidates, &query_vec, |m| m.embedding.as_deref());
        let text_hits = self.memory_text_hits(query).await.unwrap_or_else(|e| {
            warn!(error = %e, "lexical memory search failed");
            Vec::new()
        });

        Ok(merge_scored(
            vector_hits,
            text_hits,
            self.weights,
            query.min_score.unwrap_or(self.weights.min_score),
            query.effective_limit(self.weights),
        ))
    }

    /// Same state machine as memories, over indexed chunks.
    pub async fn search_chunks(&self, query: &SearchQuery) -> Result<Vec<Scored<Chunk>>> {
        let limit = query.effective_limit(self.weights);
        let Some(query_vec) = self.query_embedding(&query.query).await else {
            record_search("lexical");
            let hits = self.store.search_chunks_text(query, limit).await?;
            return Ok(filter_lexical(hits, query.min_score));
        };
        record_search("hybrid");

        let candidates = match self
            .store
            .chunk_vector_candidates(self.weights.vector_scan_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "chunk vector scan failed, using lexical results only");
                let hits = self.store.search_chunks_text(query, limit).await?;
                return Ok(filter_lexical(hits, query.min_score));
            },
        };
        let vector_hits = vector_hits(candidates, &query_vec, |c| c.embedding.as_deref());
        let text_hits = self
            .store
            .search_chunks_text(query, limit)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "lexical chunk search failed");
                Vec::new()
            });

        Ok(merge_scored(
            vector_hits,
            text_hits,
            self.weights,
            query.min_score.unwrap_or(self.weights.min_score),
            limit,
        ))
    }

    async fn memory_text_hits(&self, query: &SearchQuery) -> Result<Vec<Scored<Memory>>> {
        let hits = self
            .store
            .search_memories_text(query, query.effective_limit(self.weights))
            .await?;
        if !hits.is_empty() {
            let ids: Vec<String> = hits.iter().map(|h| h.item.id.clone()).collect();
            if let Err(e) = self.store.record_access(&ids).await {
                warn!(error = %e, count = ids.len(), "failed to record memory access");
            }
        }
        Ok(hits)
    }

    /// The query vector, or `None` when the vector path should be skipped.
    async fn query_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let provider = self.provider?;
        match embed_and_cache(self.store, provider, text, self.timeout).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => {
                debug!(provider = provider.id(), "empty query embedding, lexical only");
                None
            },
            Err(e) => {
                warn!(provider = provider.id(), error = %e, "query embedding failed, lexical only");
                None
            },
        }
    }
}

fn vector_hits<T>(
    candidates: Vec<T>,
    query_vec: &[f32],
    embedding: impl Fn(&T) -> Option<&[f32]>,
) -> Vec<(T, f64)> {
    candidates
        .into_iter()
        .filter_map(|item| {
            let score = cosine_similarity(query_vec, embedding(&item)?);
            (score > 0.0).then_some((item, score))
        })
        .collect()
}

fn filter_lexical<T>(hits: Vec<Scored<T>>, min_score: Option<f64>) -> Vec<Scored<T>> {
    match min_score {
        Some(min) => hits.into_iter().filter(|h| h.score >= min).collect(),
        None => hits,
    }
}

#[cfg(feature = "metrics")]
fn record_search(mode: &'static str) {
    counter!("mnemo_memory_searches_total", "mode" => mode).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn record_search(_mode: &'static str) {}
