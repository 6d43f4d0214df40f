/// Local feature-hashing embedder: deterministic, offline, no model weights.
use {
    async_trait::async_trait,
    sha2::{Digest, Sha256},
};

use crate::embeddings::EmbeddingProvider;

/// Bag-of-words vectors via the hashing trick, L2-normalised.
///
/// Each lowercase alphanumeric token lands in one bucket with a sign taken from
/// the same digest, so unrelated tokens cancel out on average. Texts sharing
/// vocabulary get positive cosine similarity, which is enough for recall over
/// a project's own notes.
pub struct HashedEmbeddingProvider {
    model: String,
    dims: usize,
}

impl HashedEmbeddingProvider {
    pub const DEFAULT_DIMS: usize = 256;
    pub const DEFAULT_MODEL: &'static str = "fh-v1";

    pub fn new(dims: usize) -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            dims: dims.max(1),
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 {
                1.0
            } else {
                -1.0
            };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for HashedEmbeddingProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashedEmbeddingProvider {
    fn id(&self) -> &str {
        "hashed"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}
