//! Markdown daily logs and `MEMORY.md` under the project memory directory.
//!
//! Session-scoped types are appended chronologically with a timestamp; the
//! structured types are grouped under one `## <Heading>` section each, new items
//! landing at the end of their section so sections stay contiguous.

use std::path::{Path, PathBuf};

use {chrono::NaiveDateTime, tracing::debug};

use crate::{config::MemoryConfig, error::Result, types::MemoryType};

pub const MEMORY_MD: &str = "MEMORY.md";
const MEMORY_MD_HEADER: &str = "# Project Memory\n";

/// One line to append to today's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyLogEntry {
    pub memory_type: MemoryType,
    pub content: String,
    /// Rendered in parentheses after the content when non-empty.
    pub metadata: String,
}

impl DailyLogEntry {
    pub fn new(memory_type: MemoryType, content: impl Into<String>) -> Self {
        Self {
            memory_type,
            content: content.into(),
            metadata: String::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// Append `entry` to `<memory dir>/<YYYY-MM-DD>.md` for the date of `now`
/// (local wall-clock time). Returns the project-relative path written.
pub async fn append_daily_log(
    project_dir: &Path,
    config: &MemoryConfig,
    entry: &DailyLogEntry,
    now: NaiveDateTime,
) -> Result<String> {
    let date = now.format("%Y-%m-%d").to_string();
    let file_name = format!("{date}.md");
    let abs = config.memory_dir(project_dir).join(&file_name);

    let mut content = read_or_empty(&abs).await?;
    if content.is_empty() {
        content = format!("# {date}\n");
    }

    let text = with_metadata(&entry.content, &entry.metadata);
    let content = if entry.memory_type.is_chronological() {
        let label = title_case(entry.memory_type.as_str());
        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("- [{}] **{label}**: {text}\n", now.format("%H:%M:%S")));
        content
    } else {
        append_under_section(
            &content,
            section_heading(entry.memory_type),
            &format!("- {text}"),
        )
    };

    write_atomic(&abs, &content).await?;
    debug!(path = %abs.display(), kind = %entry.memory_type, "appended daily log entry");
    Ok(config.relative_memory_path(&file_name))
}

/// Append `- content` under `## section` in `<memory dir>/MEMORY.md`.
pub async fn append_memory_md(
    project_dir: &Path,
    config: &MemoryConfig,
    section: &str,
    content: &str,
) -> Result<String> {
    let abs = config.memory_dir(project_dir).join(MEMORY_MD);
    let mut existing = read_or_empty(&abs).await?;
    if existing.is_empty() {
        existing = MEMORY_MD_HEADER.to_string();
    }
    let updated = append_under_section(&existing, section, &format!("- {content}"));
    write_atomic(&abs, &updated).await?;
    Ok(config.relative_memory_path(MEMORY_MD))
}

/// Section heading for the structured memory types.
pub fn section_heading(memory_type: MemoryType) -> &'static str {
    match memory_type {
        MemoryType::Decision => "Decision",
        MemoryType::Learning => "Learning",
        MemoryType::ErrorFix => "Error Fix",
        MemoryType::SessionSummary => "Session Summary",
        MemoryType::ToolUsage => "Tool Usage",
        MemoryType::UserPrompt => "User Prompt",
        MemoryType::AssistantResponse => "Assistant Response",
    }
}

/// Insert `item` as the last non-blank line of `## heading`, creating the
/// section at the end of `content` when it is missing.
pub fn append_under_section(content: &str, heading: &str, item: &str) -> String {
    let header = format!("## {heading}");
    let mut lines: Vec<&str> = content.split('\n').collect();

    let Some(section) = lines.iter().position(|l| l.trim() == header) else {
        let mut out = content.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("\n{header}\n\n{item}\n"));
        return out;
    };

    let next = lines[section + 1..]
        .iter()
        .position(|l| l.trim().starts_with("## "))
        .map_or(lines.len(), |i| section + 1 + i);
    let mut at = next;
    while at > section + 1 && lines[at - 1].trim().is_empty() {
        at -= 1;
    }
    lines.insert(at, item);
    lines.join("\n")
}

fn with_metadata(content: &str, metadata: &str) -> String {
    if metadata.is_empty() {
        content.to_string()
    } else {
        format!("{content} ({metadata})")
    }
}

/// `error_fix` → `Error Fix`
fn title_case(snake: &str) -> String {
    snake
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

async fn read_or_empty(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file in the same directory, then rename over `path`.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp: PathBuf = dir.join(format!(".{name}.tmp-{:08x}", rand::random::<u32>()));

    if let Err(e) = tokio::fs::write(&tmp, content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
