//! Entities persisted by the memory store.

use std::{fmt, time::Duration};

use {
    chrono::{DateTime, NaiveDateTime, Utc},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

/// Kind of an atomic memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    SessionSummary,
    Decision,
    Learning,
    ErrorFix,
    ToolUsage,
    UserPrompt,
    AssistantResponse,
}

impl MemoryType {
    pub const ALL: [MemoryType; 7] = [
        MemoryType::SessionSummary,
        MemoryType::Decision,
        MemoryType::Learning,
        MemoryType::ErrorFix,
        MemoryType::ToolUsage,
        MemoryType::UserPrompt,
        MemoryType::AssistantResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::SessionSummary => "session_summary",
            MemoryType::Decision => "decision",
            MemoryType::Learning => "learning",
            MemoryType::ErrorFix => "error_fix",
            MemoryType::ToolUsage => "tool_usage",
            MemoryType::UserPrompt => "user_prompt",
            MemoryType::AssistantResponse => "assistant_response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Session-scoped types are logged chronologically rather than grouped
    /// under a section heading.
    pub fn is_chronological(&self) -> bool {
        matches!(
            self,
            MemoryType::UserPrompt | MemoryType::AssistantResponse | MemoryType::ToolUsage
        )
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic fact remembered for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub session_id: String,
    pub project_dir: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    pub content_hash: String,
    /// Opaque structured string supplied by the producer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
}

impl Memory {
    pub fn new(
        session_id: impl Into<String>,
        project_dir: impl Into<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: generate_id(),
            session_id: session_id.into(),
            project_dir: project_dir.into(),
            memory_type,
            content_hash: content_hash(&content),
            content,
            metadata: String::new(),
            embedding: None,
            created_at: Utc::now(),
            accessed_at: None,
            access_count: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Fill in the ID and content hash if the producer left them empty.
    pub(crate) fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = generate_id();
        }
        if self.content_hash.is_empty() {
            self.content_hash = content_hash(&self.content);
        }
    }
}

/// One row of session history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    Architecture,
    Pattern,
    Convention,
    Decision,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::Architecture => "architecture",
            KnowledgeType::Pattern => "pattern",
            KnowledgeType::Convention => "convention",
            KnowledgeType::Decision => "decision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "architecture" => Some(KnowledgeType::Architecture),
            "pattern" => Some(KnowledgeType::Pattern),
            "convention" => Some(KnowledgeType::Convention),
            "decision" => Some(KnowledgeType::Decision),
            _ => None,
        }
    }
}

/// A durable project-level fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectKnowledge {
    pub id: String,
    pub project_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    pub knowledge_type: Option<KnowledgeType>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectKnowledge {
    pub fn new(
        project_dir: impl Into<String>,
        knowledge_type: KnowledgeType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            project_dir: project_dir.into(),
            file_path: String::new(),
            knowledge_type: Some(knowledge_type),
            content: content.into(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// A heading-aware slice of an indexed markdown file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Store-assigned sequence; zero until persisted.
    pub id: i64,
    pub path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
    pub hash: String,
    pub heading: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// Indexing state of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    pub path: String,
    /// Source file modification time, unix milliseconds.
    pub last_modified: i64,
    pub chunk_count: usize,
    /// Unix milliseconds of the last successful index pass.
    pub last_indexed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_memories: usize,
    pub total_sessions: usize,
    pub total_knowledge: usize,
    pub total_chunks: usize,
    pub total_files: usize,
    pub db_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<DateTime<Utc>>,
}

/// Garbage collection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcOptions {
    #[serde(rename = "max_age_secs", with = "duration_secs")]
    pub max_age: Duration,
    pub max_count: usize,
    /// Session history rows kept per project.
    pub sessions_kept: usize,
    pub dry_run: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(90 * 24 * 60 * 60),
            max_count: 1000,
            sessions_kept: 100,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub deleted_by_age: usize,
    pub deleted_by_count: usize,
    pub remaining: usize,
}

/// SHA-256 of `content`, hex encoded. Used for dedup, cache keys and change detection.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Time-ordered opaque ID: unix nanoseconds plus a random suffix.
pub fn generate_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{nanos}-{:08x}", rand::random::<u32>())
}

/// Fixed-width so lexical order in SQLite equals chronological order.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp stored by this crate or by SQLite's own `CURRENT_TIMESTAMP`.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
