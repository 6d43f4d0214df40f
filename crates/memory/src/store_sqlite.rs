/// SQLite-backed implementation of [`MemoryStore`] via sqlx.
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, TimeDelta, Utc},
    sqlx::{
        Sqlite, SqliteConnection, SqlitePool, Transaction,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    },
    tracing::{debug, warn},
};

use crate::{
    embeddings::{decode_embedding, encode_embedding},
    error::{Error, Result},
    schema::{FtsSupport, detect_fts, ensure_schema},
    search::{SUBSTRING_MATCH_SCORE, Scored, SearchQuery, build_fts_query, rank_to_score},
    store::{MemoryStore, PendingEmbedding},
    types::{
        Chunk, FileIndexEntry, GcOptions, GcReport, KnowledgeType, Memory, MemoryStats,
        MemoryType, ProjectKnowledge, SessionRecord, format_timestamp, generate_id,
        parse_timestamp,
    },
};

macro_rules! memory_columns {
    () => {
        "m.id, m.session_id, m.project_dir, m.type, m.content, m.content_hash, m.metadata, \
         m.embedding, m.created_at, m.accessed_at, m.access_count"
    };
}

macro_rules! chunk_columns {
    () => {
        "c.id, c.path, c.start_line, c.end_line, c.text, c.hash, c.heading, c.embedding"
    };
}

macro_rules! session_columns {
    () => {
        "session_id, project_dir, started_at, ended_at, summary, topics, files_modified, model"
    };
}

/// Default page size for listings when the caller passes zero.
const DEFAULT_LIST_LIMIT: usize = 20;
const DEFAULT_SESSION_LIMIT: usize = 10;

/// Single-connection pool over a private in-memory database.
///
/// Every connection to `:memory:` is its own database, so the pool is pinned to
/// one connection that never expires.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub struct SqliteMemoryStore {
    pool: SqlitePool,
    fts: FtsSupport,
    db_path: Option<PathBuf>,
}

impl SqliteMemoryStore {
    /// Open (creating if needed) the database at `path` in WAL mode and bring
    /// its schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, Some(path.to_path_buf())).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::from_pool(memory_pool().await?, None).await
    }

    pub async fn from_pool(pool: SqlitePool, db_path: Option<PathBuf>) -> Result<Self> {
        ensure_schema(&pool).await?;
        let fts = detect_fts(&pool).await?;
        if !fts.memories || !fts.chunks {
            warn!(
                memories = fts.memories,
                chunks = fts.chunks,
                "FTS5 unavailable, lexical search uses substring matching"
            );
        }
        Ok(Self { pool, fts, db_path })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction holding the write lock from its first statement.
    ///
    /// A deferred transaction that reads before writing must upgrade its lock,
    /// and in WAL mode that upgrade fails with `SQLITE_BUSY` without waiting
    /// on the busy timeout when another connection writes first.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub fn fts(&self) -> FtsSupport {
        self.fts
    }

    /// Pretend FTS5 is missing so the substring paths can be exercised.
    #[cfg(test)]
    fn without_fts(mut self) -> Self {
        self.fts = FtsSupport::default();
        self
    }

    async fn count(&self, sql: &str, bind: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(sql)
            .bind(bind)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

// ── Row types ───────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: String,
    session_id: String,
    project_dir: String,
    #[sqlx(rename = "type")]
    memory_type: String,
    content: String,
    content_hash: String,
    metadata: Option<String>,
    embedding: Option<Vec<u8>>,
    created_at: Option<String>,
    accessed_at: Option<String>,
    access_count: Option<i64>,
}

impl MemoryRow {
    /// Rows with a type this build does not know are skipped.
    fn into_memory(self) -> Option<Memory> {
        let Some(memory_type) = MemoryType::parse(&self.memory_type) else {
            warn!(id = %self.id, kind = %self.memory_type, "skipping memory with unknown type");
            return None;
        };
        Some(Memory {
            id: self.id,
            session_id: self.session_id,
            project_dir: self.project_dir,
            memory_type,
            content: self.content,
            content_hash: self.content_hash,
            metadata: self.metadata.unwrap_or_default(),
            embedding: self.embedding.as_deref().and_then(decode_embedding),
            created_at: self
                .created_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_default(),
            accessed_at: self.accessed_at.as_deref().and_then(parse_timestamp),
            access_count: self.access_count.unwrap_or(0),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RankedMemoryRow {
    #[sqlx(flatten)]
    memory: MemoryRow,
    rank: f64,
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: i64,
    path: String,
    start_line: i64,
    end_line: i64,
    text: String,
    hash: String,
    heading: Option<String>,
    embedding: Option<Vec<u8>>,
}

impl From<ChunkRow> for Chunk {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            path: row.path,
            start_line: row.start_line.max(0) as usize,
            end_line: row.end_line.max(0) as usize,
            text: row.text,
            hash: row.hash,
            heading: row.heading.unwrap_or_default(),
            embedding: row.embedding.as_deref().and_then(decode_embedding),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RankedChunkRow {
    #[sqlx(flatten)]
    chunk: ChunkRow,
    rank: f64,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    path: String,
    last_modified: i64,
    chunk_count: i64,
    last_indexed: i64,
}

impl From<FileRow> for FileIndexEntry {
    fn from(row: FileRow) -> Self {
        Self {
            path: row.path,
            last_modified: row.last_modified,
            chunk_count: row.chunk_count.max(0) as usize,
            last_indexed: row.last_indexed,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    project_dir: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    summary: Option<String>,
    topics: Option<String>,
    files_modified: Option<String>,
    model: Option<String>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            project_dir: row.project_dir,
            started_at: row.started_at.as_deref().and_then(parse_timestamp),
            ended_at: row.ended_at.as_deref().and_then(parse_timestamp),
            summary: row.summary.unwrap_or_default(),
            topics: parse_string_list(row.topics.as_deref()),
            files_modified: parse_string_list(row.files_modified.as_deref()),
            model: row.model.unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct KnowledgeRow {
    id: String,
    project_dir: String,
    file_path: Option<String>,
    knowledge_type: Option<String>,
    content: String,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl From<KnowledgeRow> for ProjectKnowledge {
    fn from(row: KnowledgeRow) -> Self {
        Self {
            id: row.id,
            project_dir: row.project_dir,
            file_path: row.file_path.unwrap_or_default(),
            knowledge_type: row.knowledge_type.as_deref().and_then(KnowledgeType::parse),
            content: row.content,
            created_at: row
                .created_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_default(),
            updated_at: row.updated_at.as_deref().and_then(parse_timestamp),
        }
    }
}

/// Malformed JSON lists read back as empty.
fn parse_string_list(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn memories(rows: Vec<MemoryRow>) -> Vec<Memory> {
    rows.into_iter().filter_map(MemoryRow::into_memory).collect()
}

/// Database file plus its WAL, which holds recent writes until checkpoint.
async fn on_disk_size(path: &Path) -> u64 {
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    let mut total = 0;
    for file in [path.to_path_buf(), PathBuf::from(wal)] {
        if let Ok(meta) = tokio::fs::metadata(&file).await {
            total += meta.len();
        }
    }
    total
}

fn cutoff(max_age: Duration) -> String {
    let age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
    let at = Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    format_timestamp(&at)
}

async fn insert_memory(conn: &mut SqliteConnection, m: &Memory, fts: bool) -> Result<()> {
    let embedding = m
        .embedding
        .as_deref()
        .filter(|e| !e.is_empty())
        .map(encode_embedding);
    sqlx::query(
        "INSERT OR REPLACE INTO memories
            (id, session_id, project_dir, type, content, content_hash, metadata,
             embedding, created_at, accessed_at, access_count)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&m.id)
    .bind(&m.session_id)
    .bind(&m.project_dir)
    .bind(m.memory_type.as_str())
    .bind(&m.content)
    .bind(&m.content_hash)
    .bind(&m.metadata)
    .bind(embedding)
    .bind(format_timestamp(&m.created_at))
    .bind(m.accessed_at.as_ref().map(format_timestamp))
    .bind(m.access_count)
    .execute(&mut *conn)
    .await?;

    if fts {
        sqlx::query("DELETE FROM memories_fts WHERE id = ?")
            .bind(&m.id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "INSERT INTO memories_fts (content, id, project_dir, type) VALUES (?, ?, ?, ?)",
        )
        .bind(&m.content)
        .bind(&m.id)
        .bind(&m.project_dir)
        .bind(m.memory_type.as_str())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    // ── Memories ────────────────────────────────────────────────────────

    async fn save(&self, memory: &Memory) -> Result<()> {
        let mut memory = memory.clone();
        memory.normalize();
        let mut tx = self.begin_write().await?;
        insert_memory(&mut tx, &memory, self.fts.memories).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_if_new(&self, memory: &Memory) -> Result<bool> {
        let mut memory = memory.clone();
        memory.normalize();
        let mut tx = self.begin_write().await?;
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM memories WHERE project_dir = ? AND content_hash = ? LIMIT 1",
        )
        .bind(&memory.project_dir)
        .bind(&memory.content_hash)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = existing {
            debug!(existing = %id, "duplicate memory, not saved");
            return Ok(false);
        }
        insert_memory(&mut tx, &memory, self.fts.memories).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get(&self, id_or_prefix: &str) -> Result<Memory> {
        if id_or_prefix.is_empty() {
            return Err(Error::not_found("memory", id_or_prefix));
        }
        let exact: Option<MemoryRow> = sqlx::query_as(concat!(
            "SELECT ",
            memory_columns!(),
            " FROM memories m WHERE m.id = ?"
        ))
        .bind(id_or_prefix)
        .fetch_optional(&self.pool)
        .await?;
        let row = match exact {
            Some(row) => Some(row),
            None => {
                sqlx::query_as(concat!(
                    "SELECT ",
                    memory_columns!(),
                    " FROM memories m WHERE substr(m.id, 1, length(?)) = ?
                      ORDER BY m.created_at DESC LIMIT 1"
                ))
                .bind(id_or_prefix)
                .bind(id_or_prefix)
                .fetch_optional(&self.pool)
                .await?
            },
        };
        row.and_then(MemoryRow::into_memory)
            .ok_or_else(|| Error::not_found("memory", id_or_prefix))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        if self.fts.memories {
            sqlx::query("DELETE FROM memories_fts WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let deleted = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn list_recent(&self, project_dir: &str, limit: usize) -> Result<Vec<Memory>> {
        let limit = if limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit
        };
        let rows: Vec<MemoryRow> = sqlx::query_as(concat!(
            "SELECT ",
            memory_columns!(),
            " FROM memories m WHERE m.project_dir = ?
              ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
        ))
        .bind(project_dir)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(memories(rows))
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<Memory>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(concat!(
            "SELECT ",
            memory_columns!(),
            " FROM memories m WHERE m.session_id = ? ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(memories(rows))
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<usize> {
        let mut tx = self.begin_write().await?;
        if self.fts.memories {
            sqlx::query(
                "DELETE FROM memories_fts WHERE id IN (SELECT id FROM memories WHERE session_id = ?)",
            )
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }
        let deleted = sqlx::query("DELETE FROM memories WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn update_memory_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        let updated = sqlx::query("UPDATE memories SET embedding = ? WHERE id = ?")
            .bind(encode_embedding(embedding))
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::not_found("memory", id));
        }
        Ok(())
    }

    async fn unembedded_memories(
        &self,
        project_dir: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PendingEmbedding>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, content FROM memories
             WHERE project_dir = ?
               AND (? IS NULL OR session_id = ?)
               AND (embedding IS NULL OR length(embedding) = 0)
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(project_dir)
        .bind(session_id)
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, content)| PendingEmbedding { id, content })
            .collect())
    }

    async fn record_access(&self, ids: &[String]) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let mut tx = self.begin_write().await?;
        for id in ids {
            sqlx::query(
                "UPDATE memories SET accessed_at = ?, access_count = COALESCE(access_count, 0) + 1
                 WHERE id = ?",
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn garbage_collect(&self, project_dir: &str, opts: &GcOptions) -> Result<GcReport> {
        let defaults = GcOptions::default();
        let max_age = if opts.max_age.is_zero() {
            defaults.max_age
        } else {
            opts.max_age
        };
        let max_count = if opts.max_count == 0 {
            defaults.max_count
        } else {
            opts.max_count
        };
        let cutoff = cutoff(max_age);

        let mut tx = self.begin_write().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memories WHERE project_dir = ?")
            .bind(project_dir)
            .fetch_one(&mut *tx)
            .await?;
        let by_age: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM memories WHERE project_dir = ? AND created_at < ?",
        )
        .bind(project_dir)
        .bind(&cutoff)
        .fetch_one(&mut *tx)
        .await?;
        let after_age = (total - by_age).max(0) as usize;
        let by_count = after_age.saturating_sub(max_count);
        let report = GcReport {
            deleted_by_age: by_age as usize,
            deleted_by_count: by_count,
            remaining: after_age - by_count,
        };

        if opts.dry_run {
            return Ok(report);
        }

        if self.fts.memories {
            sqlx::query(
                "DELETE FROM memories_fts WHERE id IN
                    (SELECT id FROM memories WHERE project_dir = ? AND created_at < ?)",
            )
            .bind(project_dir)
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM memories WHERE project_dir = ? AND created_at < ?")
            .bind(project_dir)
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        if by_count > 0 {
            const OLDEST: &str = "SELECT id FROM memories WHERE project_dir = ?
                                  ORDER BY created_at ASC, id ASC LIMIT ?";
            if self.fts.memories {
                sqlx::query(&format!("DELETE FROM memories_fts WHERE id IN ({OLDEST})"))
                    .bind(project_dir)
                    .bind(by_count as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query(&format!("DELETE FROM memories WHERE id IN ({OLDEST})"))
                .bind(project_dir)
                .bind(by_count as i64)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "DELETE FROM session_history WHERE session_id IN (
                SELECT session_id FROM session_history WHERE project_dir = ?
                ORDER BY ended_at DESC LIMIT -1 OFFSET ?)",
        )
        .bind(project_dir)
        .bind(opts.sessions_kept as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            project = project_dir,
            by_age = report.deleted_by_age,
            by_count = report.deleted_by_count,
            remaining = report.remaining,
            "memory garbage collection"
        );
        Ok(report)
    }

    // ── Sessions & knowledge ────────────────────────────────────────────

    async fn save_session(&self, session: &SessionRecord) -> Result<()> {
        let ended_at = session.ended_at.unwrap_or_else(Utc::now);
        sqlx::query(concat!(
            "INSERT OR REPLACE INTO session_history (",
            session_columns!(),
            ") VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&session.session_id)
        .bind(&session.project_dir)
        .bind(session.started_at.as_ref().map(format_timestamp))
        .bind(format_timestamp(&ended_at))
        .bind(&session.summary)
        .bind(serde_json::to_string(&session.topics)?)
        .bind(serde_json::to_string(&session.files_modified)?)
        .bind(&session.model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(concat!(
            "SELECT ",
            session_columns!(),
            " FROM session_history WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn last_session(&self, project_dir: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions_for_project(project_dir, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn sessions_for_project(
        &self,
        project_dir: &str,
        limit: usize,
    ) -> Result<Vec<SessionRecord>> {
        let limit = if limit == 0 {
            DEFAULT_SESSION_LIMIT
        } else {
            limit
        };
        let rows: Vec<SessionRow> = sqlx::query_as(concat!(
            "SELECT ",
            session_columns!(),
            " FROM session_history WHERE project_dir = ? ORDER BY ended_at DESC LIMIT ?"
        ))
        .bind(project_dir)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_knowledge(&self, knowledge: &ProjectKnowledge) -> Result<String> {
        let id = if knowledge.id.is_empty() {
            generate_id()
        } else {
            knowledge.id.clone()
        };
        sqlx::query(
            "INSERT OR REPLACE INTO project_knowledge
                (id, project_dir, file_path, knowledge_type, content, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&knowledge.project_dir)
        .bind(&knowledge.file_path)
        .bind(knowledge.knowledge_type.map(|k| k.as_str()))
        .bind(&knowledge.content)
        .bind(format_timestamp(&knowledge.created_at))
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn project_knowledge(&self, project_dir: &str) -> Result<Vec<ProjectKnowledge>> {
        let rows: Vec<KnowledgeRow> = sqlx::query_as(
            "SELECT id, project_dir, file_path, knowledge_type, content, created_at, updated_at
             FROM project_knowledge WHERE project_dir = ?
             ORDER BY updated_at DESC, id DESC",
        )
        .bind(project_dir)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ── Files & chunks ──────────────────────────────────────────────────

    async fn get_file(&self, path: &str) -> Result<Option<FileIndexEntry>> {
        let row: Option<FileRow> = sqlx::query_as(
            "SELECT path, last_modified, chunk_count, last_indexed FROM file_index WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_files(&self) -> Result<Vec<FileIndexEntry>> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT path, last_modified, chunk_count, last_indexed FROM file_index ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn replace_chunks(&self, entry: &FileIndexEntry, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.begin_write().await?;

        if self.fts.chunks {
            sqlx::query(
                "INSERT INTO chunks_fts (chunks_fts, rowid, text)
                 SELECT 'delete', id, text FROM chunks WHERE path = ?",
            )
            .bind(&entry.path)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(&entry.path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let embedding = chunk
                .embedding
                .as_deref()
                .filter(|e| !e.is_empty())
                .map(encode_embedding);
            let id = sqlx::query(
                "INSERT INTO chunks (path, start_line, end_line, text, hash, heading, embedding)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.path)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(&chunk.heading)
            .bind(embedding)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            if self.fts.chunks {
                sqlx::query("INSERT INTO chunks_fts (rowid, text) VALUES (?, ?)")
                    .bind(id)
                    .bind(&chunk.text)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO file_index (path, last_modified, chunk_count, last_indexed)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.path)
        .bind(entry.last_modified)
        .bind(chunks.len() as i64)
        .bind(entry.last_indexed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn chunks_for_file(&self, path: &str) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(concat!(
            "SELECT ",
            chunk_columns!(),
            " FROM chunks c WHERE c.path = ? ORDER BY c.start_line, c.id"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn remove_file(&self, path: &str) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        if self.fts.chunks {
            sqlx::query(
                "INSERT INTO chunks_fts (chunks_fts, rowid, text)
                 SELECT 'delete', id, text FROM chunks WHERE path = ?",
            )
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }
        let chunks = sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let entries = sqlx::query("DELETE FROM file_index WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(chunks + entries > 0)
    }

    // ── Embedding cache ─────────────────────────────────────────────────

    async fn cached_embedding(
        &self,
        content_hash: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT embedding FROM embedding_cache
             WHERE content_hash = ? AND provider = ? AND model = ?",
        )
        .bind(content_hash)
        .bind(provider)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blob.and_then(|b| {
            let decoded = decode_embedding(&b);
            if decoded.is_none() {
                debug!(hash = content_hash, len = b.len(), "ignoring malformed cached embedding");
            }
            decoded
        }))
    }

    async fn cache_embedding(
        &self,
        content_hash: &str,
        provider: &str,
        model: &str,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO embedding_cache
                (content_hash, provider, model, embedding, dims, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(content_hash)
        .bind(provider)
        .bind(model)
        .bind(encode_embedding(embedding))
        .bind(embedding.len() as i64)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_embedding_cache(&self, max_age: Duration) -> Result<usize> {
        let deleted = sqlx::query("DELETE FROM embedding_cache WHERE created_at < ?")
            .bind(cutoff(max_age))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted as usize)
    }

    async fn count_cached_embeddings(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn evict_embedding_cache(&self, keep: usize) -> Result<usize> {
        let deleted = sqlx::query(
            "DELETE FROM embedding_cache WHERE rowid NOT IN (
                SELECT rowid FROM embedding_cache ORDER BY created_at DESC, rowid DESC LIMIT ?)",
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted as usize)
    }

    // ── Search ──────────────────────────────────────────────────────────

    async fn search_memories_text(
        &self,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<Scored<Memory>>> {
        let memory_type = query.memory_type.map(|t| t.as_str());

        if self.fts.memories {
            let Some(fts_query) = build_fts_query(&query.query) else {
                return Ok(Vec::new());
            };
            let ranked: std::result::Result<Vec<RankedMemoryRow>, sqlx::Error> =
                sqlx::query_as(concat!(
                    "SELECT ",
                    memory_columns!(),
                    ", rank FROM memories_fts JOIN memories m ON memories_fts.id = m.id
                     WHERE memories_fts MATCH ?
                       AND (? = '' OR m.project_dir = ?)
                       AND (? IS NULL OR m.type = ?)
                     ORDER BY rank LIMIT ?"
                ))
                .bind(&fts_query)
                .bind(&query.project_dir)
                .bind(&query.project_dir)
                .bind(memory_type)
                .bind(memory_type)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await;
            match ranked {
                Ok(rows) => {
                    return Ok(rows
                        .into_iter()
                        .filter_map(|r| {
                            let score = rank_to_score(r.rank);
                            r.memory.into_memory().map(|m| Scored::text(m, score))
                        })
                        .collect());
                },
                Err(e) => {
                    debug!(query = %fts_query, error = %e, "FTS query failed, using substring match");
                },
            }
        }

        if query.query.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<MemoryRow> = sqlx::query_as(concat!(
            "SELECT ",
            memory_columns!(),
            " FROM memories m
              WHERE instr(m.content, ?) > 0
                AND (? = '' OR m.project_dir = ?)
                AND (? IS NULL OR m.type = ?)
              ORDER BY m.created_at DESC LIMIT ?"
        ))
        .bind(&query.query)
        .bind(&query.project_dir)
        .bind(&query.project_dir)
        .bind(memory_type)
        .bind(memory_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(memories(rows)
            .into_iter()
            .map(|m| Scored::text(m, SUBSTRING_MATCH_SCORE))
            .collect())
    }

    async fn memory_vector_candidates(
        &self,
        query: &SearchQuery,
        scan_limit: usize,
    ) -> Result<Vec<Memory>> {
        let memory_type = query.memory_type.map(|t| t.as_str());
        let rows: Vec<MemoryRow> = sqlx::query_as(concat!(
            "SELECT ",
            memory_columns!(),
            " FROM memories m
              WHERE m.project_dir = ?
                AND m.embedding IS NOT NULL AND length(m.embedding) > 0
                AND (? IS NULL OR m.type = ?)
              LIMIT ?"
        ))
        .bind(&query.project_dir)
        .bind(memory_type)
        .bind(memory_type)
        .bind(scan_limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(memories(rows)
            .into_iter()
            .filter(|m| m.embedding.is_some())
            .collect())
    }

    async fn search_chunks_text(
        &self,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<Scored<Chunk>>> {
        if self.fts.chunks {
            let Some(fts_query) = build_fts_query(&query.query) else {
                return Ok(Vec::new());
            };
            let ranked: std::result::Result<Vec<RankedChunkRow>, sqlx::Error> =
                sqlx::query_as(concat!(
                    "SELECT ",
                    chunk_columns!(),
                    ", rank FROM chunks_fts JOIN chunks c ON chunks_fts.rowid = c.id
                     WHERE chunks_fts MATCH ?
                     ORDER BY rank LIMIT ?"
                ))
                .bind(&fts_query)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await;
            match ranked {
                Ok(rows) => {
                    return Ok(rows
                        .into_iter()
                        .map(|r| Scored::text(r.chunk.into(), rank_to_score(r.rank)))
                        .collect());
                },
                Err(e) => {
                    debug!(query = %fts_query, error = %e, "chunk FTS query failed, using substring match");
                },
            }
        }

        if query.query.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ChunkRow> = sqlx::query_as(concat!(
            "SELECT ",
            chunk_columns!(),
            " FROM chunks c WHERE instr(c.text, ?) > 0 ORDER BY c.id LIMIT ?"
        ))
        .bind(&query.query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Scored::text(r.into(), SUBSTRING_MATCH_SCORE))
            .collect())
    }

    async fn chunk_vector_candidates(&self, scan_limit: usize) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(concat!(
            "SELECT ",
            chunk_columns!(),
            " FROM chunks c WHERE c.embedding IS NOT NULL AND length(c.embedding) > 0 LIMIT ?"
        ))
        .bind(scan_limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(Chunk::from)
            .filter(|c| c.embedding.is_some())
            .collect())
    }

    async fn stats(&self, project_dir: &str) -> Result<MemoryStats> {
        let (oldest, newest): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT MIN(created_at), MAX(created_at) FROM memories WHERE project_dir = ?",
        )
        .bind(project_dir)
        .fetch_one(&self.pool)
        .await?;
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let total_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_index")
            .fetch_one(&self.pool)
            .await?;
        let db_size_bytes = match &self.db_path {
            Some(path) => on_disk_size(path).await,
            None => 0,
        };

        Ok(MemoryStats {
            total_memories: self
                .count("SELECT COUNT(*) FROM memories WHERE project_dir = ?", project_dir)
                .await?,
            total_sessions: self
                .count(
                    "SELECT COUNT(*) FROM session_history WHERE project_dir = ?",
                    project_dir,
                )
                .await?,
            total_knowledge: self
                .count(
                    "SELECT COUNT(*) FROM project_knowledge WHERE project_dir = ?",
                    project_dir,
                )
                .await?,
            total_chunks: total_chunks as usize,
            total_files: total_files as usize,
            db_size_bytes,
            oldest_memory: oldest.as_deref().and_then(parse_timestamp),
            newest_memory: newest.as_deref().and_then(parse_timestamp),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::types::content_hash,
        rstest::rstest,
        std::sync::Arc,
        tokio::task::JoinSet,
    };

    async fn store() -> SqliteMemoryStore {
        SqliteMemoryStore::open_in_memory().await.unwrap()
    }

    fn memory(project: &str, content: &str) -> Memory {
        Memory::new("s1", project, MemoryType::Learning, content)
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - TimeDelta::days(days)
    }

    fn chunk(start: usize, end: usize, text: &str) -> Chunk {
        Chunk {
            id: 0,
            path: "memory/notes.md".into(),
            start_line: start,
            end_line: end,
            text: text.into(),
            hash: content_hash(text),
            heading: String::new(),
            embedding: None,
        }
    }

    fn entry(path: &str, modified: i64) -> FileIndexEntry {
        FileIndexEntry {
            path: path.into(),
            last_modified: modified,
            chunk_count: 0,
            last_indexed: modified,
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let store = store().await;
        let m = memory("/p", "prefer sqlx over diesel").with_metadata(r#"{"k":1}"#);
        store.save(&m).await.unwrap();

        let got = store.get(&m.id).await.unwrap();
        assert_eq!(got.content, m.content);
        assert_eq!(got.metadata, m.metadata);
        assert_eq!(got.memory_type, MemoryType::Learning);
        assert_eq!(got.content_hash, content_hash("prefer sqlx over diesel"));
    }

    #[tokio::test]
    async fn get_accepts_unique_prefix() {
        let store = store().await;
        let mut m = memory("/p", "prefixed");
        m.id = "abc123-ffff".into();
        store.save(&m).await.unwrap();

        assert_eq!(store.get("abc1").await.unwrap().id, "abc123-ffff");
        let err = store.get("zzz").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "memory", .. }));
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn prefix_with_like_wildcards_is_literal() {
        let store = store().await;
        let mut m = memory("/p", "x");
        m.id = "abc".into();
        store.save(&m).await.unwrap();
        assert!(store.get("a%").await.is_err());
        assert!(store.get("_b").await.is_err());
    }

    #[tokio::test]
    async fn save_if_new_deduplicates_per_project() {
        let store = store().await;
        assert!(store.save_if_new(&memory("/p", "same")).await.unwrap());
        assert!(!store.save_if_new(&memory("/p", "same")).await.unwrap());
        assert!(store.save_if_new(&memory("/other", "same")).await.unwrap());
        assert_eq!(store.list_recent("/p", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_memory_and_search_entry() {
        let store = store().await;
        let m = memory("/p", "ephemeral rust note");
        store.save(&m).await.unwrap();
        assert!(store.delete(&m.id).await.unwrap());
        assert!(!store.delete(&m.id).await.unwrap());

        let hits = store
            .search_memories_text(&SearchQuery::new("/p", "ephemeral"), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let store = store().await;
        for (i, text) in ["old", "mid", "new"].into_iter().enumerate() {
            let m = memory("/p", text).with_created_at(days_ago(3 - i as i64));
            store.save(&m).await.unwrap();
        }
        let listed: Vec<_> = store
            .list_recent("/p", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(listed, ["new", "mid"]);
    }

    #[tokio::test]
    async fn session_listing_and_deletion() {
        let store = store().await;
        store
            .save(&Memory::new("a", "/p", MemoryType::UserPrompt, "first").with_created_at(days_ago(2)))
            .await
            .unwrap();
        store
            .save(&Memory::new("a", "/p", MemoryType::AssistantResponse, "second"))
            .await
            .unwrap();
        store
            .save(&Memory::new("b", "/p", MemoryType::Decision, "unrelated"))
            .await
            .unwrap();

        let listed = store.list_by_session("a").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].content, "first");

        assert_eq!(store.delete_by_session("a").await.unwrap(), 2);
        assert!(store.list_by_session("a").await.unwrap().is_empty());
        let hits = store
            .search_memories_text(&SearchQuery::new("/p", "first"), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn text_search_filters_project_and_type() {
        let store = store().await;
        store
            .save(&Memory::new("s", "/p", MemoryType::Decision, "use sqlite for storage"))
            .await
            .unwrap();
        store
            .save(&Memory::new("s", "/p", MemoryType::Learning, "sqlite WAL needs a checkpoint"))
            .await
            .unwrap();
        store
            .save(&Memory::new("s", "/q", MemoryType::Decision, "sqlite elsewhere"))
            .await
            .unwrap();

        let all = store
            .search_memories_text(&SearchQuery::new("/p", "sqlite"), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|h| h.score > 0.0 && h.score <= 1.0));

        let decisions = store
            .search_memories_text(
                &SearchQuery::new("/p", "sqlite").with_type(MemoryType::Decision),
                10,
            )
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].item.content, "use sqlite for storage");

        let everywhere = store
            .search_memories_text(&SearchQuery::new("", "sqlite"), 10)
            .await
            .unwrap();
        assert_eq!(everywhere.len(), 3);
    }

    #[tokio::test]
    async fn punctuation_only_query_returns_nothing() {
        let store = store().await;
        store.save(&memory("/p", "anything")).await.unwrap();
        let hits = store
            .search_memories_text(&SearchQuery::new("/p", "?!*"), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn substring_fallback_without_fts() {
        let store = store().await.without_fts();
        store.save(&memory("/p", "Tokio runtime notes")).await.unwrap();

        let hits = store
            .search_memories_text(&SearchQuery::new("/p", "runtime"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, SUBSTRING_MATCH_SCORE);

        // Case-sensitive.
        let miss = store
            .search_memories_text(&SearchQuery::new("/p", "tokio"), 10)
            .await
            .unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn record_access_bumps_counters() {
        let store = store().await;
        let m = memory("/p", "touched");
        store.save(&m).await.unwrap();
        store
            .record_access(&[m.id.clone(), m.id.clone()])
            .await
            .unwrap();
        let got = store.get(&m.id).await.unwrap();
        assert_eq!(got.access_count, 2);
        assert!(got.accessed_at.is_some());
    }

    #[tokio::test]
    async fn embeddings_update_and_pending_list() {
        let store = store().await;
        let m = memory("/p", "needs vector");
        store.save(&m).await.unwrap();
        assert_eq!(store.unembedded_memories("/p", None, 10).await.unwrap().len(), 1);

        store
            .update_memory_embedding(&m.id, &[0.6, 0.8])
            .await
            .unwrap();
        assert!(store.unembedded_memories("/p", None, 10).await.unwrap().is_empty());
        assert_eq!(store.get(&m.id).await.unwrap().embedding, Some(vec![0.6, 0.8]));

        let candidates = store
            .memory_vector_candidates(&SearchQuery::new("/p", "x"), 10)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);

        assert!(store.update_memory_embedding("missing", &[1.0]).await.is_err());
    }

    #[tokio::test]
    async fn gc_removes_old_memories() {
        let store = store().await;
        for i in 0..10 {
            let age = if i < 3 { 100 } else { 1 };
            let m = memory("/p", &format!("memory {i}")).with_created_at(days_ago(age));
            store.save(&m).await.unwrap();
        }
        let opts = GcOptions {
            max_age: Duration::from_secs(90 * 86_400),
            max_count: 1000,
            ..GcOptions::default()
        };

        let dry = store
            .garbage_collect("/p", &GcOptions {
                dry_run: true,
                ..opts
            })
            .await
            .unwrap();
        assert_eq!(dry, GcReport {
            deleted_by_age: 3,
            deleted_by_count: 0,
            remaining: 7,
        });
        assert_eq!(store.stats("/p").await.unwrap().total_memories, 10);

        let report = store.garbage_collect("/p", &opts).await.unwrap();
        assert_eq!(report, dry);
        assert_eq!(store.stats("/p").await.unwrap().total_memories, 7);

        let hits = store
            .search_memories_text(&SearchQuery::new("/p", "memory"), 20)
            .await
            .unwrap();
        assert_eq!(hits.len(), 7);
    }

    #[tokio::test]
    async fn gc_trims_oldest_beyond_max_count() {
        let store = store().await;
        for i in 0..5 {
            let m = memory("/p", &format!("entry {i}")).with_created_at(days_ago(10 - i));
            store.save(&m).await.unwrap();
        }
        let report = store
            .garbage_collect("/p", &GcOptions {
                max_count: 2,
                ..GcOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.deleted_by_count, 3);
        assert_eq!(report.remaining, 2);

        let left: Vec<_> = store
            .list_recent("/p", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(left, ["entry 4", "entry 3"]);
    }

    #[tokio::test]
    async fn gc_leaves_other_projects_alone() {
        let store = store().await;
        store
            .save(&memory("/other", "ancient").with_created_at(days_ago(400)))
            .await
            .unwrap();
        let report = store
            .garbage_collect("/p", &GcOptions::default())
            .await
            .unwrap();
        assert_eq!(report, GcReport::default());
        assert_eq!(store.stats("/other").await.unwrap().total_memories, 1);
    }

    #[tokio::test]
    async fn gc_keeps_most_recent_sessions() {
        let store = store().await;
        for i in 0..4 {
            store
                .save_session(&SessionRecord {
                    session_id: format!("s{i}"),
                    project_dir: "/p".into(),
                    ended_at: Some(days_ago(10 - i)),
                    ..SessionRecord::default()
                })
                .await
                .unwrap();
        }
        store
            .garbage_collect("/p", &GcOptions {
                sessions_kept: 2,
                ..GcOptions::default()
            })
            .await
            .unwrap();
        let kept: Vec<_> = store
            .sessions_for_project("/p", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(kept, ["s3", "s2"]);
    }

    #[tokio::test]
    async fn sessions_round_trip_and_order() {
        let store = store().await;
        let first = SessionRecord {
            session_id: "one".into(),
            project_dir: "/p".into(),
            started_at: Some(days_ago(2)),
            ended_at: Some(days_ago(1)),
            summary: "did things".into(),
            topics: vec!["rust".into(), "sqlite".into()],
            files_modified: vec!["src/lib.rs".into()],
            model: "m1".into(),
        };
        store.save_session(&first).await.unwrap();
        store
            .save_session(&SessionRecord {
                session_id: "two".into(),
                project_dir: "/p".into(),
                ..SessionRecord::default()
            })
            .await
            .unwrap();

        let got = store.get_session("one").await.unwrap().unwrap();
        assert_eq!(got.topics, first.topics);
        assert_eq!(got.files_modified, first.files_modified);
        assert_eq!(got.summary, "did things");

        assert_eq!(store.last_session("/p").await.unwrap().unwrap().session_id, "two");
        assert!(store.last_session("/nowhere").await.unwrap().is_none());
        assert!(store.get_session("nope").await.unwrap().is_none());
        assert_eq!(store.stats("/p").await.unwrap().total_sessions, 2);
    }

    #[tokio::test]
    async fn knowledge_upserts_and_lists() {
        let store = store().await;
        let id = store
            .save_knowledge(&ProjectKnowledge::new(
                "/p",
                KnowledgeType::Convention,
                "snake_case everywhere",
            ))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let mut updated = ProjectKnowledge::new("/p", KnowledgeType::Convention, "kebab-case");
        updated.id = id.clone();
        assert_eq!(store.save_knowledge(&updated).await.unwrap(), id);

        let all = store.project_knowledge("/p").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "kebab-case");
        assert_eq!(all[0].knowledge_type, Some(KnowledgeType::Convention));
        assert!(all[0].updated_at.is_some());
    }

    #[tokio::test]
    async fn replace_chunks_swaps_content_and_fts() {
        let store = store().await;
        let path = "memory/notes.md";
        store
            .replace_chunks(&entry(path, 1), &[
                chunk(1, 3, "alpha rust"),
                chunk(4, 6, "beta rust"),
            ])
            .await
            .unwrap();
        store
            .replace_chunks(&entry(path, 2), &[chunk(1, 2, "gamma network")])
            .await
            .unwrap();

        let chunks = store.chunks_for_file(path).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "gamma network");

        let file = store.get_file(path).await.unwrap().unwrap();
        assert_eq!(file.chunk_count, 1);
        assert_eq!(file.last_modified, 2);

        let stale = store
            .search_chunks_text(&SearchQuery::new("/p", "alpha"), 10)
            .await
            .unwrap();
        assert!(stale.is_empty());
        let fresh = store
            .search_chunks_text(&SearchQuery::new("/p", "gamma"), 10)
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn remove_file_clears_chunks_and_entry() {
        let store = store().await;
        store
            .replace_chunks(&entry("a.md", 1), &[chunk(1, 1, "only chunk")])
            .await
            .unwrap();
        assert!(store.remove_file("a.md").await.unwrap());
        assert!(!store.remove_file("a.md").await.unwrap());
        assert!(store.get_file("a.md").await.unwrap().is_none());
        assert!(store.list_files().await.unwrap().is_empty());
        let hits = store
            .search_chunks_text(&SearchQuery::new("/p", "only"), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn chunk_substring_fallback_without_fts() {
        let store = store().await.without_fts();
        store
            .replace_chunks(&entry("a.md", 1), &[chunk(1, 1, "Use WAL mode")])
            .await
            .unwrap();
        let hits = store
            .search_chunks_text(&SearchQuery::new("/p", "WAL"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text_score, SUBSTRING_MATCH_SCORE);
    }

    #[tokio::test]
    async fn embedding_cache_lookup_and_model_keying() {
        let store = store().await;
        store
            .cache_embedding("h", "mock", "m1", &[1.0, 0.0])
            .await
            .unwrap();
        assert_eq!(
            store.cached_embedding("h", "mock", "m1").await.unwrap(),
            Some(vec![1.0, 0.0])
        );
        assert!(store.cached_embedding("h", "mock", "m2").await.unwrap().is_none());
        assert!(store.cached_embedding("h", "other", "m1").await.unwrap().is_none());
    }

    #[rstest]
    #[case(5, 2, 3)]
    #[case(3, 10, 0)]
    #[case(4, 0, 4)]
    #[tokio::test]
    async fn evict_keeps_most_recent(
        #[case] entries: usize,
        #[case] keep: usize,
        #[case] evicted: usize,
    ) {
        let store = store().await;
        for i in 0..entries {
            store
                .cache_embedding(&format!("h{i}"), "mock", "m", &[i as f32])
                .await
                .unwrap();
        }
        assert_eq!(store.evict_embedding_cache(keep).await.unwrap(), evicted);
        assert_eq!(
            store.count_cached_embeddings().await.unwrap(),
            entries - evicted
        );
        if keep > 0 {
            let newest = format!("h{}", entries - 1);
            assert!(store.cached_embedding(&newest, "mock", "m").await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn prune_drops_entries_older_than_max_age() {
        let store = store().await;
        store.cache_embedding("h", "mock", "m", &[1.0]).await.unwrap();
        sqlx::query("UPDATE embedding_cache SET created_at = ?")
            .bind(format_timestamp(&days_ago(30)))
            .execute(store.pool())
            .await
            .unwrap();
        store.cache_embedding("fresh", "mock", "m", &[1.0]).await.unwrap();

        let pruned = store
            .prune_embedding_cache(Duration::from_secs(7 * 86_400))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.count_cached_embeddings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_memory_type_rows_are_skipped() {
        let store = store().await;
        store.save(&memory("/p", "good")).await.unwrap();
        sqlx::query(
            "INSERT INTO memories (id, session_id, project_dir, type, content, content_hash, created_at)
             VALUES ('bad', 's', '/p', 'gossip', 'weird', 'h', ?)",
        )
        .bind(format_timestamp(&Utc::now()))
        .execute(store.pool())
        .await
        .unwrap();
        let listed = store.list_recent("/p", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content, "good");
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".mnemo").join("memory.db");

        let store = SqliteMemoryStore::open(&path).await.unwrap();
        store.save(&memory("/p", "durable")).await.unwrap();
        let stats = store.stats("/p").await.unwrap();
        assert_eq!(stats.total_memories, 1);
        assert!(stats.db_size_bytes > 0);
        assert!(stats.oldest_memory.is_some());
        store.pool().close().await;

        let reopened = SqliteMemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_recent("/p", 10).await.unwrap()[0].content, "durable");
    }

    async fn file_store(dir: &tempfile::TempDir) -> Arc<SqliteMemoryStore> {
        Arc::new(
            SqliteMemoryStore::open(&dir.path().join("memory.db"))
                .await
                .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_save_if_new_saves_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir).await;

        let mut tasks = JoinSet::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let m = Memory::new(format!("s{i}"), "/p", MemoryType::Decision, "use WAL mode");
                store.save_if_new(&m).await
            });
        }

        let (mut saved, mut duplicates) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(true) => saved += 1,
                Ok(false) => duplicates += 1,
                Err(e) => panic!("save_if_new failed: {e}"),
            }
        }
        assert_eq!((saved, duplicates), (1, 15));
        assert_eq!(store.stats("/p").await.unwrap().total_memories, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_and_gc_share_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir).await;

        let mut tasks = JoinSet::new();
        for i in 0..24 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                if i % 6 == 5 {
                    store
                        .garbage_collect("/p", &GcOptions::default())
                        .await
                        .map(|_| ())
                } else {
                    let m = memory("/p", &format!("decision {}", i % 8));
                    store.save_if_new(&m).await.map(|_| ())
                }
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined.unwrap() {
                errors.push(e.to_string());
            }
        }
        assert!(errors.is_empty(), "storage errors: {errors:?}");

        let per_hash: Vec<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM memories WHERE project_dir = ? GROUP BY content_hash",
        )
        .bind("/p")
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(per_hash, vec![1; 8]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_upgrade_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = SqliteMemoryStore::open(&path).await.unwrap();
            store.save(&memory("/p", "kept across upgrade")).await.unwrap();
            crate::schema::set_meta(store.pool(), "schema_version", "2")
                .await
                .unwrap();
            store.pool().close().await;
        }

        let mut tasks = JoinSet::new();
        for _ in 0..4 {
            let path = path.clone();
            tasks.spawn(async move { SqliteMemoryStore::open(&path).await });
        }
        while let Some(joined) = tasks.join_next().await {
            let store = joined.unwrap().unwrap();
            assert_eq!(store.stats("/p").await.unwrap().total_memories, 1);
            store.pool().close().await;
        }

        let store = SqliteMemoryStore::open(&path).await.unwrap();
        assert_eq!(
            crate::schema::schema_version(store.pool())
                .await
                .unwrap()
                .as_deref(),
            Some(crate::schema::SCHEMA_VERSION)
        );
    }
}
