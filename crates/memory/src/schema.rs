//! Table layout, the `meta` version marker, and forward migrations.
//!
//! Versions: 1 = memories, knowledge, sessions and `memories_fts`;
//! 2 = memory embeddings and the embedding cache; 3 = chunks and file index.
//! Each migration step commits its DDL together with the version bump.

use {
    sqlx::{Sqlite, SqlitePool, Transaction},
    tracing::{debug, info, warn},
};

use crate::error::Result;

pub const SCHEMA_VERSION: &str = "3";

const SCHEMA_VERSION_KEY: &str = "schema_version";

const MEMORIES_FTS: &str = "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    id UNINDEXED,
    project_dir UNINDEXED,
    type UNINDEXED
)";

const CHUNKS_FTS: &str = "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    content=chunks,
    content_rowid=id
)";

const META: &str = "CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

const BASE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        project_dir TEXT NOT NULL,
        type TEXT NOT NULL,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        metadata TEXT,
        embedding BLOB,
        created_at TEXT NOT NULL,
        accessed_at TEXT,
        access_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS project_knowledge (
        id TEXT PRIMARY KEY,
        project_dir TEXT NOT NULL,
        file_path TEXT,
        knowledge_type TEXT,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS session_history (
        session_id TEXT PRIMARY KEY,
        project_dir TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT,
        summary TEXT,
        topics TEXT,
        files_modified TEXT,
        model TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project_dir)",
    "CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type)",
    "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_memories_hash ON memories(content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_knowledge_project ON project_knowledge(project_dir)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_project ON session_history(project_dir)",
];

const EMBEDDING_CACHE: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS embedding_cache (
        content_hash TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        embedding BLOB NOT NULL,
        dims INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (content_hash, provider, model)
    )",
    "CREATE INDEX IF NOT EXISTS idx_embedding_cache_created ON embedding_cache(created_at)",
];

const CHUNK_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        heading TEXT NOT NULL DEFAULT '',
        embedding BLOB
    )",
    "CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(hash)",
    "CREATE TABLE IF NOT EXISTS file_index (
        path TEXT PRIMARY KEY,
        last_modified INTEGER NOT NULL,
        chunk_count INTEGER NOT NULL,
        last_indexed INTEGER NOT NULL
    )",
];

/// Which full-text tables exist. Every query path has a non-FTS fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FtsSupport {
    pub memories: bool,
    pub chunks: bool,
}

/// Bring the database to [`SCHEMA_VERSION`].
///
/// Known older versions migrate step by step; a missing or unrecognised marker
/// re-runs the idempotent full initialisation.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let version = match get_meta(pool, SCHEMA_VERSION_KEY).await {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "no schema marker, initialising");
            None
        },
    };

    match version.as_deref() {
        Some(SCHEMA_VERSION) => Ok(()),
        Some("2") => migrate_v2_to_v3(pool).await,
        Some("1") => {
            migrate_v1_to_v2(pool).await?;
            migrate_v2_to_v3(pool).await
        },
        other => {
            if let Some(v) = other {
                warn!(version = v, "unrecognised schema version, reinitialising");
            }
            init_schema(pool).await
        },
    }
}

/// Create every table and index that does not exist yet and stamp the current version.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    sqlx::query(META).execute(&mut *tx).await?;
    for stmt in BASE_TABLES
        .iter()
        .chain(EMBEDDING_CACHE)
        .chain(CHUNK_TABLES)
    {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    // A database stamped with garbage may predate the embedding column.
    if !has_column(&mut tx, "memories", "embedding").await? {
        sqlx::query("ALTER TABLE memories ADD COLUMN embedding BLOB")
            .execute(&mut *tx)
            .await?;
    }
    try_create_fts(&mut tx, "memories_fts", MEMORIES_FTS).await;
    try_create_fts(&mut tx, "chunks_fts", CHUNKS_FTS).await;
    set_version(&mut tx, SCHEMA_VERSION).await?;

    tx.commit().await?;
    info!(version = SCHEMA_VERSION, "memory schema initialised");
    Ok(())
}

/// Adds the memory embedding column and the embedding cache.
pub async fn migrate_v1_to_v2(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    if !has_column(&mut tx, "memories", "embedding").await? {
        sqlx::query("ALTER TABLE memories ADD COLUMN embedding BLOB")
            .execute(&mut *tx)
            .await?;
    }
    for stmt in EMBEDDING_CACHE {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    set_version(&mut tx, "2").await?;

    tx.commit().await?;
    info!(from = "1", to = "2", "memory schema migrated");
    Ok(())
}

/// Adds chunk storage and the per-file index.
pub async fn migrate_v2_to_v3(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    for stmt in CHUNK_TABLES {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    try_create_fts(&mut tx, "chunks_fts", CHUNKS_FTS).await;
    set_version(&mut tx, "3").await?;

    tx.commit().await?;
    info!(from = "2", to = "3", "memory schema migrated");
    Ok(())
}

pub async fn get_meta(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_meta(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(META).execute(pool).await?;
    sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn schema_version(pool: &SqlitePool) -> Result<Option<String>> {
    get_meta(pool, SCHEMA_VERSION_KEY).await
}

pub async fn detect_fts(pool: &SqlitePool) -> Result<FtsSupport> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('memories_fts', 'chunks_fts')",
    )
    .fetch_all(pool)
    .await?;
    Ok(FtsSupport {
        memories: names.iter().any(|n| n == "memories_fts"),
        chunks: names.iter().any(|n| n == "chunks_fts"),
    })
}

async fn set_version(tx: &mut Transaction<'_, Sqlite>, version: &str) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
        .bind(SCHEMA_VERSION_KEY)
        .bind(version)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn has_column(tx: &mut Transaction<'_, Sqlite>, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut **tx)
            .await?;
    Ok(count > 0)
}

/// FTS5 may be compiled out of the linked SQLite; that only disables ranking.
async fn try_create_fts(tx: &mut Transaction<'_, Sqlite>, name: &str, ddl: &str) {
    if let Err(e) = sqlx::query(ddl).execute(&mut **tx).await {
        warn!(table = name, error = %e, "full-text search unavailable, using substring fallback");
    }
}
