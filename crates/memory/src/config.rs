use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    chunker::ChunkOptions,
    error::{Error, Result},
    search::SearchWeights,
    types::{GcOptions, duration_secs},
};

/// Configuration for the memory subsystem.
///
/// Built once at process start (defaults, then an optional TOML file, then the
/// environment) and handed to every component that needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Project-relative hidden directory holding all state.
    pub state_dir: String,
    /// Directory under `state_dir` holding daily logs and the database.
    pub memory_subdir: String,
    /// SQLite database file name inside the memory directory.
    pub db_file: String,
    pub chunk: ChunkOptions,
    pub search: SearchWeights,
    pub embedding: EmbeddingConfig,
    pub gc: GcOptions,
    /// Embedding cache rows kept after an `index_all` pass.
    pub cache_max_rows: usize,
    #[serde(rename = "cache_max_age_secs", with = "duration_secs")]
    pub cache_max_age: Duration,
    #[serde(rename = "watch_debounce_ms", with = "duration_millis")]
    pub watch_debounce: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            state_dir: ".mnemo".into(),
            memory_subdir: "memory".into(),
            db_file: "memory.db".into(),
            chunk: ChunkOptions::default(),
            search: SearchWeights::default(),
            embedding: EmbeddingConfig::default(),
            gc: GcOptions::default(),
            cache_max_rows: 50_000,
            cache_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            watch_debounce: Duration::from_millis(500),
        }
    }
}

/// Which embedding backend to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// No embeddings; search is lexical only.
    #[default]
    None,
    /// Local feature-hashing embedder.
    Hashed,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(ProviderKind::None),
            "hashed" => Some(ProviderKind::Hashed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Upper bound on any single provider call.
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    /// Memories embedded per backfill batch.
    pub backfill_limit: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            model: None,
            dims: None,
            timeout: Duration::from_secs(10),
            backfill_limit: 100,
        }
    }
}

impl MemoryConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Overlay `MNEMO_EMBEDDING_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay `MNEMO_EMBEDDING_*` variables resolved through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MNEMO_EMBEDDING_PROVIDER") {
            self.embedding.provider = ProviderKind::parse(&raw)
                .ok_or_else(|| Error::Config(format!("unknown embedding provider: {raw}")))?;
        }
        if let Some(model) = lookup("MNEMO_EMBEDDING_MODEL").filter(|m| !m.is_empty()) {
            self.embedding.model = Some(model);
        }
        if let Some(raw) = lookup("MNEMO_EMBEDDING_DIMS") {
            let dims = raw
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("MNEMO_EMBEDDING_DIMS: not a number: {raw}")))?;
            self.embedding.dims = Some(dims);
        }
        if let Some(raw) = lookup("MNEMO_EMBEDDING_TIMEOUT_MS") {
            let ms = raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("MNEMO_EMBEDDING_TIMEOUT_MS: not a number: {raw}"))
            })?;
            self.embedding.timeout = Duration::from_millis(ms);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk.max_tokens == 0 {
            return Err(Error::Config("chunk.max_tokens must be positive".into()));
        }
        if self.embedding.dims == Some(0) {
            return Err(Error::Config("embedding.dims must be positive".into()));
        }
        let weights = &self.search;
        if weights.vector_weight < 0.0 || weights.text_weight < 0.0 {
            return Err(Error::Config("search weights must not be negative".into()));
        }
        Ok(())
    }

    /// `<project>/<state_dir>/<memory_subdir>`
    pub fn memory_dir(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.state_dir).join(&self.memory_subdir)
    }

    pub fn db_path(&self, project_dir: &Path) -> PathBuf {
        self.memory_dir(project_dir).join(&self.db_file)
    }

    /// Project-relative path of a file inside the memory directory, as stored
    /// in chunk and file-index rows.
    pub fn relative_memory_path(&self, file_name: &str) -> String {
        Path::new(&self.state_dir)
            .join(&self.memory_subdir)
            .join(file_name)
            .to_string_lossy()
            .into_owned()
    }

    /// Walk upward from `start` to the first directory containing `state_dir`.
    /// Falls back to `start` itself when no ancestor has one.
    pub fn find_project_root(&self, start: &Path) -> PathBuf {
        start
            .ancestors()
            .find(|dir| dir.join(&self.state_dir).is_dir())
            .unwrap_or(start)
            .to_path_buf()
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, std::collections::HashMap, tempfile::TempDir};

    #[test]
    fn defaults_match_documented_values() {
        let config = MemoryConfig::default();
        assert_eq!(config.chunk.max_tokens, 400);
        assert_eq!(config.chunk.overlap_tokens, 80);
        assert_eq!(config.chunk.min_chunk_bytes, 50);
        assert_eq!(config.search.vector_weight, 0.7);
        assert_eq!(config.search.text_weight, 0.3);
        assert_eq!(config.search.min_score, 0.35);
        assert_eq!(config.search.max_results, 6);
        assert_eq!(config.embedding.provider, ProviderKind::None);
        assert_eq!(config.watch_debounce, Duration::from_millis(500));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MemoryConfig::from_toml_str(
            r#"
            state_dir = ".assistant"
            watch_debounce_ms = 250

            [search]
            vector_weight = 0.5
            text_weight = 0.5

            [embedding]
            provider = "hashed"
            dims = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, ".assistant");
        assert_eq!(config.memory_subdir, "memory");
        assert_eq!(config.watch_debounce, Duration::from_millis(250));
        assert_eq!(config.search.vector_weight, 0.5);
        assert_eq!(config.search.min_score, 0.35);
        assert_eq!(config.embedding.provider, ProviderKind::Hashed);
        assert_eq!(config.embedding.dims, Some(64));
        assert_eq!(config.embedding.timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_toml_values_are_rejected() {
        assert!(matches!(
            MemoryConfig::from_toml_str("[embedding]\nprovider = \"carrier-pigeon\""),
            Err(Error::Toml(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("[chunk]\nmax_tokens = 0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memory.toml");
        std::fs::write(&path, "cache_max_rows = 10\n").unwrap();
        let config = MemoryConfig::load(&path).unwrap();
        assert_eq!(config.cache_max_rows, 10);
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("MNEMO_EMBEDDING_PROVIDER", "Hashed"),
            ("MNEMO_EMBEDDING_MODEL", "fh-v2"),
            ("MNEMO_EMBEDDING_DIMS", "32"),
            ("MNEMO_EMBEDDING_TIMEOUT_MS", "1500"),
        ]
        .into_iter()
        .collect();
        let mut config = MemoryConfig::default();
        config
            .apply_env_with(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.embedding.provider, ProviderKind::Hashed);
        assert_eq!(config.embedding.model.as_deref(), Some("fh-v2"));
        assert_eq!(config.embedding.dims, Some(32));
        assert_eq!(config.embedding.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn env_overlay_rejects_unknown_provider() {
        let mut config = MemoryConfig::default();
        let err = config
            .apply_env_with(|k| (k == "MNEMO_EMBEDDING_PROVIDER").then(|| "gpt".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn paths_are_project_relative() {
        let config = MemoryConfig::default();
        let project = Path::new("/work/app");
        assert_eq!(
            config.memory_dir(project),
            PathBuf::from("/work/app/.mnemo/memory")
        );
        assert_eq!(
            config.db_path(project),
            PathBuf::from("/work/app/.mnemo/memory/memory.db")
        );
        assert_eq!(
            config.relative_memory_path("2026-01-27.md"),
            ".mnemo/memory/2026-01-27.md"
        );
    }

    #[test]
    fn find_project_root_walks_upward() {
        let tmp = TempDir::new().unwrap();
        let config = MemoryConfig::default();
        std::fs::create_dir_all(tmp.path().join(".mnemo")).unwrap();
        let nested = tmp.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(config.find_project_root(&nested), tmp.path());

        let other = TempDir::new().unwrap();
        assert_eq!(config.find_project_root(other.path()), other.path());
    }
}
