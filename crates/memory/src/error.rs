//! Error types for the memory store.
//!
//! Storage failures are fatal to the calling operation. Embedding failures are
//! surfaced as [`Error::Embedding`] / [`Error::EmbeddingTimeout`] so callers can
//! degrade to lexical-only search instead of failing the whole request.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedding provider failed: {0}")]
    Embedding(String),

    #[error("embedding provider timed out after {0:?}")]
    EmbeddingTimeout(Duration),

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("file watcher error: {0}")]
    Watcher(String),
}

impl Error {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Whether this error came from the embedding provider rather than storage.
    ///
    /// Provider errors never fail a query; callers fall back to text search.
    pub fn is_embedding(&self) -> bool {
        matches!(self, Self::Embedding(_) | Self::EmbeddingTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
