//! Project-local memory: atomic memories and markdown logs → chunked → embedded → hybrid search in SQLite.

pub mod chunker;
pub mod config;
pub mod daily_log;
pub mod embedding_cache;
pub mod embeddings;
pub mod embeddings_hashed;
pub mod error;
pub mod indexer;
pub mod manager;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;
pub mod types;
#[cfg(feature = "file-watcher")]
pub mod watcher;

pub use {
    config::MemoryConfig,
    embeddings::EmbeddingProvider,
    error::{Error, Result},
    manager::{MemoryManager, MemoryStatus},
    search::{Scored, SearchQuery, SearchWeights},
    store::MemoryStore,
    store_sqlite::SqliteMemoryStore,
    types::{Chunk, GcOptions, GcReport, Memory, MemoryType},
};
