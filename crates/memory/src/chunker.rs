/// Heading-aware markdown chunker with line overlap between consecutive chunks.
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::{Chunk, content_hash};

/// Approximate bytes per token for English text.
const BYTES_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkOptions {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// Chunks shorter than this (after overlap) are dropped as noise.
    pub min_chunk_bytes: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 80,
            min_chunk_bytes: 50,
        }
    }
}

struct Section<'a> {
    heading: &'a str,
    lines: &'a [&'a str],
    /// 1-based line number of `lines[0]` in the file.
    start_line: usize,
}

/// Split markdown `content` into chunks for `path`.
///
/// Sections start at `## ` headings. A section that fits in the byte budget is
/// one chunk; larger ones split at blank lines, then at line boundaries. Each
/// chunk is prefixed with the trailing lines of the previous one. Output is
/// fully determined by `content` and `opts`.
pub fn chunk_file(path: &str, content: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }
    let opts = if opts.max_tokens == 0 {
        ChunkOptions::default()
    } else {
        *opts
    };
    let max_bytes = opts.max_tokens * BYTES_PER_TOKEN;
    let overlap_bytes = opts.overlap_tokens * BYTES_PER_TOKEN;

    let lines: Vec<&str> = content.split('\n').collect();
    let mut chunks = Vec::new();
    let mut overlap: &[&str] = &[];

    for section in split_by_headings(&lines) {
        for block in split_large_section(section.lines, max_bytes) {
            let block_lines = &section.lines[block.clone()];
            let text = overlap
                .iter()
                .chain(block_lines)
                .copied()
                .collect::<Vec<_>>()
                .join("\n");
            if text.len() < opts.min_chunk_bytes {
                continue;
            }

            let start_line = section.start_line + block.start;
            chunks.push(Chunk {
                id: 0,
                path: path.to_string(),
                start_line,
                end_line: start_line + block_lines.len() - 1,
                hash: content_hash(&text),
                text,
                heading: section.heading.to_string(),
                embedding: None,
            });

            overlap = tail_lines(block_lines, overlap_bytes);
        }
    }

    chunks
}

fn split_by_headings<'a>(lines: &'a [&'a str]) -> Vec<Section<'a>> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut heading = "";

    for (i, line) in lines.iter().enumerate() {
        if let Some(title) = line.trim().strip_prefix("## ") {
            if i > start {
                sections.push(Section {
                    heading,
                    lines: &lines[start..i],
                    start_line: start + 1,
                });
            }
            start = i;
            heading = title.trim();
        }
    }
    if start < lines.len() {
        sections.push(Section {
            heading,
            lines: &lines[start..],
            start_line: start + 1,
        });
    }

    sections
}

/// Byte length of `lines` joined with newlines.
fn joined_len(lines: &[&str]) -> usize {
    lines.iter().map(|l| l.len()).sum::<usize>() + lines.len().saturating_sub(1)
}

/// Ranges into `lines`, each within `max_bytes` unless a single line exceeds it.
fn split_large_section(lines: &[&str], max_bytes: usize) -> Vec<Range<usize>> {
    if joined_len(lines) <= max_bytes {
        return vec![0..lines.len()];
    }

    let mut result = Vec::new();
    for block in split_at_paragraphs(lines, max_bytes) {
        if joined_len(&lines[block.clone()]) <= max_bytes {
            result.push(block);
        } else {
            let offset = block.start;
            result.extend(
                split_at_lines(&lines[block], max_bytes)
                    .into_iter()
                    .map(|r| r.start + offset..r.end + offset),
            );
        }
    }
    result
}

/// Group lines into paragraphs (a blank line opens a new paragraph), then merge
/// consecutive paragraphs while they fit in `max_bytes`.
fn split_at_paragraphs(lines: &[&str], max_bytes: usize) -> Vec<Range<usize>> {
    let mut paragraphs = Vec::new();
    let mut start = 0;
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() && i > start {
            paragraphs.push(start..i);
            start = i;
        }
    }
    if start < lines.len() {
        paragraphs.push(start..lines.len());
    }

    let mut blocks = Vec::new();
    let mut block: Option<Range<usize>> = None;
    for para in paragraphs {
        block = match block {
            Some(cur) if joined_len(&lines[cur.start..para.end]) > max_bytes => {
                blocks.push(cur);
                Some(para)
            },
            Some(cur) => Some(cur.start..para.end),
            None => Some(para),
        };
    }
    blocks.extend(block);
    blocks
}

fn split_at_lines(lines: &[&str], max_bytes: usize) -> Vec<Range<usize>> {
    let mut blocks = Vec::new();
    let mut start = 0;
    let mut size = 0;
    for (i, line) in lines.iter().enumerate() {
        let line_size = line.len() + 1;
        if size + line_size > max_bytes && i > start {
            blocks.push(start..i);
            start = i;
            size = 0;
        }
        size += line_size;
    }
    if start < lines.len() {
        blocks.push(start..lines.len());
    }
    blocks
}

/// Longest suffix of `lines` whose newline-terminated size fits in `max_bytes`.
fn tail_lines<'a>(lines: &'a [&'a str], max_bytes: usize) -> &'a [&'a str] {
    let mut size = 0;
    let mut start = lines.len();
    for (i, line) in lines.iter().enumerate().rev() {
        let line_size = line.len() + 1;
        if size + line_size > max_bytes {
            break;
        }
        size += line_size;
        start = i;
    }
    &lines[start..]
}
