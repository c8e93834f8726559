// src/parser/mod.rs
// Transcript parsers: heterogeneous JSONL session logs in, a uniform typed
// event stream out. One module per source format.

pub mod claude;
pub mod codex;

use crate::db::types::{
    NewConversation, NewFileEdit, NewMessage, NewThinkingBlock, NewToolResult, NewToolUse,
};
use chrono::DateTime;
use std::path::PathBuf;

/// Uniform output of both parsers.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub conversations: Vec<NewConversation>,
    pub messages: Vec<NewMessage>,
    pub tool_uses: Vec<NewToolUse>,
    pub tool_results: Vec<NewToolResult>,
    pub thinking_blocks: Vec<NewThinkingBlock>,
    pub file_edits: Vec<NewFileEdit>,
    /// Transcript folders visited during this parse.
    pub indexed_folders: Vec<PathBuf>,
    /// Lines that failed to parse (never fatal).
    pub parse_errors: u64,
    /// Files skipped: unreadable, headerless, or untouched in incremental mode.
    pub skipped_files: u64,
}

impl ParseResult {
    /// Fold another result into this one.
    pub fn merge(&mut self, other: ParseResult) {
        self.conversations.extend(other.conversations);
        self.messages.extend(other.messages);
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
        self.thinking_blocks.extend(other.thinking_blocks);
        self.file_edits.extend(other.file_edits);
        self.indexed_folders.extend(other.indexed_folders);
        self.parse_errors += other.parse_errors;
        self.skipped_files += other.skipped_files;
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty() && self.messages.is_empty()
    }
}

/// Parse an ISO-8601 timestamp into epoch milliseconds.
pub(crate) fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Should a file be skipped in incremental mode?
///
/// Files whose mtime is at or before `last_indexed_ms` carry nothing new:
/// both transcript formats are append-only.
pub(crate) fn is_untouched(path: &std::path::Path, last_indexed_ms: Option<i64>) -> bool {
    let Some(cutoff) = last_indexed_ms else {
        return false;
    };
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    let mtime_ms = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(i64::MAX);
    mtime_ms <= cutoff
}

/// File-edit tool names and the input key carrying the file path.
pub(crate) fn file_edit_kind(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "Edit" | "MultiEdit" => Some("edit"),
        "Write" => Some("write"),
        "NotebookEdit" => Some("edit"),
        _ => None,
    }
}

/// Pull a file path out of a tool input payload.
pub(crate) fn file_path_from_input(input: &serde_json::Value) -> Option<String> {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .or_else(|| input.get("notebook_path"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_ms() {
        assert_eq!(parse_timestamp_ms("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_timestamp_ms("1970-01-01T00:00:01.500Z"), Some(1500));
        assert!(parse_timestamp_ms("2026-01-01T00:00:00+02:00").is_some());
        assert_eq!(parse_timestamp_ms("not a time"), None);
        assert_eq!(parse_timestamp_ms(""), None);
    }

    #[test]
    fn test_file_edit_kind() {
        assert_eq!(file_edit_kind("Edit"), Some("edit"));
        assert_eq!(file_edit_kind("Write"), Some("write"));
        assert_eq!(file_edit_kind("Bash"), None);
    }

    #[test]
    fn test_file_path_from_input() {
        let input = serde_json::json!({"file_path": "/src/main.rs", "content": "x"});
        assert_eq!(file_path_from_input(&input).as_deref(), Some("/src/main.rs"));
        let input = serde_json::json!({"command": "ls"});
        assert_eq!(file_path_from_input(&input), None);
    }

    #[test]
    fn test_merge_accumulates_counts() {
        let mut a = ParseResult {
            parse_errors: 2,
            skipped_files: 1,
            ..Default::default()
        };
        let b = ParseResult {
            parse_errors: 3,
            skipped_files: 0,
            ..Default::default()
        };
        a.merge(b);
        assert_eq!(a.parse_errors, 5);
        assert_eq!(a.skipped_files, 1);
    }
}
