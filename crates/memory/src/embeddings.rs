/// Embedding provider capability, vector blob codec and call-bounding helpers.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;

#[cfg(feature = "metrics")]
use metrics::histogram;

use crate::{
    config::{EmbeddingConfig, ProviderKind},
    embeddings_hashed::HashedEmbeddingProvider,
    error::{Error, Result},
};

/// A source of fixed-length text embeddings.
///
/// The store only ever scopes cache entries by `id()` and `model()`; it never
/// branches on which implementation it was handed.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier of the backend, e.g. `"hashed"`.
    fn id(&self) -> &str;

    fn model(&self) -> &str;

    fn dims(&self) -> usize;

    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embed many texts in one call. The default issues one query per text;
    /// remote backends should override it with a real batch request.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_query(text).await?);
        }
        Ok(out)
    }
}

/// Build the provider selected by `config`, or `None` for lexical-only search.
pub fn provider_from_config(config: &EmbeddingConfig) -> Option<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        ProviderKind::None => None,
        ProviderKind::Hashed => {
            let mut provider = HashedEmbeddingProvider::new(
                config
                    .dims
                    .unwrap_or(HashedEmbeddingProvider::DEFAULT_DIMS),
            );
            if let Some(model) = &config.model {
                provider = provider.with_model(model.clone());
            }
            Some(Arc::new(provider))
        },
    }
}

/// Run a provider call with an upper bound on its duration.
///
/// Provider failures become [`Error::Embedding`], an elapsed timer becomes
/// [`Error::EmbeddingTimeout`].
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let result = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Embedding(format!("{e:#}"))),
        Err(_) => Err(Error::EmbeddingTimeout(timeout)),
    };

    #[cfg(feature = "metrics")]
    histogram!("mnemo_memory_embedding_duration_seconds").record(start.elapsed().as_secs_f64());

    result
}

/// Little-endian `f32` bytes, as stored in BLOB columns.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]. Empty or truncated blobs decode to `None`.
pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    pub(crate) const KEYWORDS: [&str; 8] = [
        "rust", "sqlite", "database", "memory", "search", "network", "cooking", "music",
    ];

    /// One dimension per keyword: 1.0 when the text mentions it.
    pub(crate) fn keyword_embedding(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .map(|kw| {
                if lower.contains(kw) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Deterministic keyword-bag embedder that counts provider calls.
    #[derive(Default)]
    pub(crate) struct MockEmbedder {
        pub queries: AtomicUsize,
        pub batches: AtomicUsize,
        pub batch_items: AtomicUsize,
    }

    impl MockEmbedder {
        pub fn calls(&self) -> usize {
            self.queries.load(Ordering::SeqCst) + self.batches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        fn id(&self) -> &str {
            "mock"
        }

        fn model(&self) -> &str {
            "mock-model"
        }

        fn dims(&self) -> usize {
            KEYWORDS.len()
        }

        async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(keyword_embedding(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.batch_items.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| keyword_embedding(t)).collect())
        }
    }

    /// Always fails, like a provider with a revoked API key.
    pub(crate) struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn id(&self) -> &str {
            "failing"
        }

        fn model(&self) -> &str {
            "none"
        }

        fn dims(&self) -> usize {
            KEYWORDS.len()
        }

        async fn embed_query(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("401 unauthorized")
        }
    }

    /// Never answers within any reasonable timeout.
    pub(crate) struct SlowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedder {
        fn id(&self) -> &str {
            "slow"
        }

        fn model(&self) -> &str {
            "slow-model"
        }

        fn dims(&self) -> usize {
            KEYWORDS.len()
        }

        async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(keyword_embedding(text))
        }
    }

    #[test]
    fn blob_codec_preserves_values() {
        let v = vec![0.0_f32, -1.5, 3.25, f32::MIN_POSITIVE];
        let blob = encode_embedding(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(decode_embedding(&blob), Some(v));
    }

    #[test]
    fn malformed_blobs_decode_to_none() {
        assert_eq!(decode_embedding(&[]), None);
        assert_eq!(decode_embedding(&[0, 0, 128]), None);
    }

    #[tokio::test]
    async fn default_batch_delegates_to_query() {
        struct QueryOnly;

        #[async_trait]
        impl EmbeddingProvider for QueryOnly {
            fn id(&self) -> &str {
                "q"
            }

            fn model(&self) -> &str {
                "q"
            }

            fn dims(&self) -> usize {
                8
            }

            async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
                Ok(keyword_embedding(text))
            }
        }

        let out = QueryOnly
            .embed_batch(&["rust".to_string(), "music".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0][0], 1.0);
        assert_eq!(out[1][7], 1.0);
    }

    #[tokio::test]
    async fn with_timeout_maps_failures() {
        let err = with_timeout(Duration::from_secs(1), FailingEmbedder.embed_query("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding(ref m) if m.contains("401")));

        let err = with_timeout(Duration::from_millis(10), SlowEmbedder.embed_query("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingTimeout(d) if d == Duration::from_millis(10)));

        let ok = with_timeout(
            Duration::from_secs(1),
            MockEmbedder::default().embed_query("rust"),
        )
        .await
        .unwrap();
        assert_eq!(ok.len(), KEYWORDS.len());
    }

    #[test]
    fn provider_selection_follows_config() {
        assert!(provider_from_config(&EmbeddingConfig::default()).is_none());

        let provider = provider_from_config(&EmbeddingConfig {
            provider: ProviderKind::Hashed,
            dims: Some(32),
            model: Some("fh-test".into()),
            ..EmbeddingConfig::default()
        })
        .unwrap();
        assert_eq!(provider.id(), "hashed");
        assert_eq!(provider.model(), "fh-test");
        assert_eq!(provider.dims(), 32);
    }
}
