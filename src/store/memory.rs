//! Cross-session memory persistence in Markdown (§4.D).

use crate::models::{MemoryEntry, MemoryKind};
use crate::store::atomic::{atomic_write, FileLock};
use chrono::Utc;
use std::path::{Path, PathBuf};

const TEMPLATE: &str = "# Memories\n\n## Patterns\n\n## Decisions\n\n## Fixes\n";

pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Vec<MemoryEntry> {
        if !self.path.exists() {
            return Vec::new();
        }
        let Ok(_lock) = FileLock::acquire_shared(&self.path) else {
            return Vec::new();
        };
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        parse_memories(&content)
    }

    pub fn append(&self, entry: &MemoryEntry) -> std::io::Result<()> {
        let to_io_err = |e: crate::error::RasenError| match e {
            crate::error::RasenError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        };

        let _lock = FileLock::acquire_exclusive(&self.path).map_err(to_io_err)?;

        let content = std::fs::read_to_string(&self.path).unwrap_or_else(|_| TEMPLATE.to_string());
        let section = section_header(entry.kind);
        let formatted = format_entry(entry);

        let updated = if let Some(idx) = content.find(section) {
            let split_at = idx + section.len();
            let (before, after) = content.split_at(split_at);
            format!("{before}\n{formatted}{after}")
        } else {
            format!("{content}\n{section}\n{formatted}")
        };

        atomic_write(&self.path, &updated).map_err(to_io_err)
    }

    /// Most-recent-first, truncated to roughly `max_tokens` (a word-count
    /// heuristic, not an exact tokenizer) for prompt injection.
    pub fn format_for_injection(&self, max_tokens: u32) -> String {
        let memories = self.load();
        if memories.is_empty() {
            return String::new();
        }

        let mut out = String::from("## Relevant Memories from Previous Sessions\n\n");
        let mut token_estimate: u32 = 10;

        for memory in memories.iter().rev() {
            let line = format!("- **{}**: {}\n", memory.kind, memory.content);
            let entry_tokens = (line.split_whitespace().count() as f64 * 1.3) as u32;
            if token_estimate + entry_tokens > max_tokens {
                break;
            }
            out.push_str(&line);
            token_estimate += entry_tokens;
        }

        out
    }

    pub fn search(&self, query: &str) -> Vec<MemoryEntry> {
        let query_lower = query.to_lowercase();
        self.load()
            .into_iter()
            .filter(|m| {
                m.content.to_lowercase().contains(&query_lower)
                    || m.tags.iter().any(|t| t.to_lowercase().contains(&query_lower))
            })
            .collect()
    }

    pub fn next_id(&self) -> String {
        let date = Utc::now().format("%Y%m%d").to_string();
        let count = self
            .load()
            .iter()
            .filter(|m| m.id.contains(&date))
            .count();
        format!("mem-{date}-{:03}", count + 1)
    }
}

fn section_header(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Pattern => "## Patterns",
        MemoryKind::Decision => "## Decisions",
        MemoryKind::Fix => "## Fixes",
    }
}

fn format_entry(entry: &MemoryEntry) -> String {
    format!("- {}\n", entry.content)
}

/// Parses the simple `- content` bullet format under section headers. The
/// legacy `### mem-id` block format is not produced by [`MemoryStore::append`]
/// anymore but old memory files in that shape still parse correctly.
fn parse_memories(content: &str) -> Vec<MemoryEntry> {
    let mut memories = Vec::new();
    let mut current_section: Option<MemoryKind> = None;
    let mut counter = 0;

    for raw_line in content.lines() {
        let line = raw_line.trim();

        if line.starts_with("## Decision") {
            current_section = Some(MemoryKind::Decision);
        } else if line.starts_with("## Learning") {
            current_section = Some(MemoryKind::Pattern);
        } else if line.starts_with("## Fix") {
            current_section = Some(MemoryKind::Fix);
        } else if line.starts_with("## Pattern") {
            current_section = Some(MemoryKind::Pattern);
        } else if line.starts_with("## ") {
            current_section = None;
        }

        if let Some(kind) = current_section {
            if let Some(rest) = line.strip_prefix("- ") {
                if !rest.is_empty() && !rest.starts_with("<!--") {
                    counter += 1;
                    memories.push(MemoryEntry {
                        id: format!("mem-simple-{counter:03}"),
                        kind,
                        content: rest.to_string(),
                        tags: Vec::new(),
                        created_at: Utc::now(),
                    });
                }
            }
        }
    }

    if memories.is_empty() {
        memories = parse_legacy_memories(content);
    }

    memories
}

fn parse_legacy_memories(content: &str) -> Vec<MemoryEntry> {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(
            r#"(?s)### (mem-\d{8}-\d+)\n> (.*?)\n<!-- tags: (.*?) \| created: (.*?) -->"#,
        )
        .expect("valid legacy memory regex")
    });

    let mut memories = Vec::new();
    for caps in pattern.captures_iter(content) {
        let mem_id = caps[1].to_string();
        let mem_content = caps[2].trim().to_string();
        let tags: Vec<String> = caps[3].split(',').map(|t| t.trim().to_string()).collect();
        let created_at = chrono::DateTime::parse_from_rfc3339(&caps[4])
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let start = caps.get(0).unwrap().start();
        let before = &content[..start];
        let kind = if before.contains("## Fixes") {
            MemoryKind::Fix
        } else if before.contains("## Decisions") {
            MemoryKind::Decision
        } else {
            MemoryKind::Pattern
        };

        memories.push(MemoryEntry {
            id: mem_id,
            kind,
            content: mem_content,
            tags,
            created_at,
        });
    }
    memories
}
