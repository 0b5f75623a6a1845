//! Markdown-aware text chunker.
//!
//! Splits a document body into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. The body is first cut into sections at ATX headings
//! (ignoring `#` lines inside fenced code blocks), then each section is
//! packed paragraph by paragraph. Paragraphs longer than the limit are hard
//! split on whitespace.
//!
//! Also parses the optional `---` front-matter block at the top of a note,
//! which may override the title and the published slug.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Metadata read from a leading front-matter block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrontMatter {
    pub title: Option<String>,
    pub slug: Option<String>,
}

/// Splits `text` into its front matter and the remaining body.
///
/// Only `key: value` lines are understood; anything else in the block is
/// ignored. Text without a closed `---` block is returned unchanged.
pub fn parse_front_matter(text: &str) -> (FrontMatter, &str) {
    let rest = match text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    {
        Some(rest) => rest,
        None => return (FrontMatter::default(), text),
    };

    let mut front = FrontMatter::default();
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim();
        if trimmed == "---" {
            return (front, &rest[offset..]);
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'').trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "title" => front.title = Some(value.to_string()),
                "slug" => front.slug = Some(value.to_string()),
                _ => {}
            }
        }
    }

    (FrontMatter::default(), text)
}

/// First level-one heading in the body, if any.
pub fn extract_title(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Split markdown into chunks with contiguous indices starting at 0.
///
/// A blank body yields no chunks.
pub fn chunk_markdown(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut chunks = Vec::new();

    for section in split_sections(text) {
        let mut buf = String::new();

        for para in section.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.len() > max_chars {
                flush(&mut buf, document_id, &mut chunks);
                for piece in hard_split(trimmed, max_chars) {
                    push_chunk(document_id, piece, &mut chunks);
                }
                continue;
            }

            let would_be = if buf.is_empty() {
                trimmed.len()
            } else {
                buf.len() + 2 + trimmed.len()
            };
            if would_be > max_chars {
                flush(&mut buf, document_id, &mut chunks);
            }
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }

        flush(&mut buf, document_id, &mut chunks);
    }

    chunks
}

fn split_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        if !in_fence && is_heading(trimmed) && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }

    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

/// Cuts `text` into pieces of at most `max_chars` bytes, preferring newline
/// or space boundaries and never splitting inside a UTF-8 sequence.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining);
            break;
        }
        let mut split_at = max_chars;
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            // A single character wider than the limit
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let window = &remaining[..split_at];
        let actual = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .filter(|pos| *pos > 0)
            .unwrap_or(split_at);

        let piece = remaining[..actual].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[actual..];
    }

    pieces
}

fn flush(buf: &mut String, document_id: &str, chunks: &mut Vec<Chunk>) {
    if !buf.is_empty() {
        push_chunk(document_id, buf, chunks);
        buf.clear();
    }
}

fn push_chunk(document_id: &str, text: &str, chunks: &mut Vec<Chunk>) {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let chunk_index = chunks.len() as i64;
    chunks.push(Chunk {
        id: chunk_id(document_id, chunk_index, &hash),
        document_id: document_id.to_string(),
        chunk_index,
        text: text.to_string(),
        hash,
    });
}

/// Stable id for a chunk, so re-ingesting unchanged content keeps its ids.
fn chunk_id(document_id: &str, chunk_index: i64, hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0]);
    hasher.update(chunk_index.to_le_bytes());
    hasher.update(hash.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}
