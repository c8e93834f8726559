// src/parser/claude.rs
// Parses Claude Code JSONL session logs.
//
// One file per session under <projects_root>/<folder>/*.jsonl, where the
// folder name is the project path with separators dashed. Each line is a
// message-or-tool event:
//   - user:      human prompt (string content) or tool_result (array content)
//   - assistant: thinking, text, or tool_use content blocks
//   - system / progress / summary / file-history-snapshot: ignored here

use super::{ParseResult, file_edit_kind, file_path_from_input, is_untouched, parse_timestamp_ms};
use crate::db::types::*;
use crate::error::{MnemoError, Result};
use crate::util::{folder_name_to_path, path_to_folder_name};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

// ---------------------------------------------------------------------------
// Deserialization types (internal)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    uuid: Option<String>,
    #[serde(rename = "parentUuid")]
    parent_uuid: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    version: Option<String>,
    #[serde(rename = "gitBranch")]
    git_branch: Option<String>,
    #[serde(rename = "isSidechain")]
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    role: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    // tool_use fields
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
    // tool_result fields
    #[serde(rename = "tool_use_id")]
    tool_use_id: Option<String>,
    content: Option<serde_json::Value>,
    is_error: Option<bool>,
}

/// State accumulated per session while scanning a file.
#[derive(Default)]
struct SessionAccumulator {
    project_path: Option<String>,
    git_branch: Option<String>,
    client_version: Option<String>,
    first_ts: Option<i64>,
    last_ts: Option<i64>,
    /// Last successfully parsed timestamp, inherited by bad ones.
    last_valid_ts: Option<i64>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse every project folder under the Claude Code projects root.
///
/// `last_indexed_ms` enables incremental mode: files whose mtime is not
/// newer are skipped entirely.
pub fn parse_projects_root(
    projects_root: &Path,
    last_indexed_ms: Option<i64>,
) -> Result<ParseResult> {
    if !projects_root.exists() {
        return Err(MnemoError::NotFound(format!(
            "Claude projects root not found: {}",
            projects_root.display()
        )));
    }

    let mut result = ParseResult::default();
    let mut folders: Vec<_> = std::fs::read_dir(projects_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    folders.sort_by_key(|e| e.file_name());

    for folder in folders {
        match parse_project_folder(&folder.path(), last_indexed_ms) {
            Ok(folder_result) => result.merge(folder_result),
            Err(e) => {
                tracing::warn!(folder = %folder.path().display(), "Skipping folder: {}", e);
                result.skipped_files += 1;
            }
        }
    }
    Ok(result)
}

/// Parse the transcript folder of a single project path.
pub fn parse_project(
    projects_root: &Path,
    project_path: &str,
    last_indexed_ms: Option<i64>,
) -> Result<ParseResult> {
    let folder = projects_root.join(path_to_folder_name(project_path));
    if !folder.exists() {
        return Err(MnemoError::NotFound(format!(
            "transcript folder not found: {}",
            folder.display()
        )));
    }
    parse_project_folder(&folder, last_indexed_ms)
}

/// Parse all session files inside one transcript folder.
pub fn parse_project_folder(folder: &Path, last_indexed_ms: Option<i64>) -> Result<ParseResult> {
    let mut result = ParseResult::default();
    result.indexed_folders.push(folder.to_path_buf());

    let fallback_project = folder
        .file_name()
        .and_then(|n| n.to_str())
        .map(folder_name_to_path);

    let mut files: Vec<_> = std::fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();

    for file in files {
        if is_untouched(&file, last_indexed_ms) {
            result.skipped_files += 1;
            continue;
        }
        match parse_session_file(&file, fallback_project.as_deref()) {
            Ok(file_result) => result.merge(file_result),
            Err(e) => {
                tracing::warn!(file = %file.display(), "Skipping session file: {}", e);
                result.skipped_files += 1;
            }
        }
    }
    Ok(result)
}

/// Parse one session JSONL file from disk.
pub fn parse_session_file(path: &Path, fallback_project: Option<&str>) -> Result<ParseResult> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(parse_session_lines(reader, fallback_project))
}

/// Parse session JSONL entries from any reader (used by tests).
pub fn parse_session_entries(data: &str, fallback_project: Option<&str>) -> ParseResult {
    parse_session_lines(BufReader::new(data.as_bytes()), fallback_project)
}

fn parse_session_lines<R: BufRead>(reader: R, fallback_project: Option<&str>) -> ParseResult {
    let mut result = ParseResult::default();
    let mut sessions: HashMap<String, SessionAccumulator> = HashMap::new();
    let mut line_count = 0u64;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => {
                result.parse_errors += 1;
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        line_count += 1;

        let entry: RawEntry = match serde_json::from_str(trimmed) {
            Ok(e) => e,
            Err(_) => {
                result.parse_errors += 1;
                continue;
            }
        };

        let Some(session_id) = entry.session_id.clone() else {
            // Header-less housekeeping lines (summary etc.) are not errors.
            continue;
        };
        let session = sessions.entry(session_id.clone()).or_default();

        if session.project_path.is_none() {
            session.project_path = entry.cwd.clone();
        }
        if session.git_branch.is_none() {
            session.git_branch = entry.git_branch.clone();
        }
        if session.client_version.is_none() {
            session.client_version = entry.version.clone();
        }

        let entry_type = entry.entry_type.as_deref().unwrap_or("unknown");
        let message_type = match entry_type {
            "user" => MessageType::User,
            "assistant" => MessageType::Assistant,
            "system" => MessageType::System,
            // progress, summary, queue-operation, file-history-snapshot…
            _ => continue,
        };

        // Timestamp discipline: unparsable timestamps inherit the session's
        // last valid one; entries with none at all are dropped.
        let parsed_ts = entry.timestamp.as_deref().and_then(parse_timestamp_ms);
        let timestamp = match parsed_ts.or(session.last_valid_ts) {
            Some(ts) => ts,
            None => {
                tracing::debug!(session = %session_id, "Dropping entry with no usable timestamp");
                continue;
            }
        };
        if parsed_ts.is_some() {
            session.last_valid_ts = parsed_ts;
        }
        session.first_ts = Some(session.first_ts.map_or(timestamp, |t: i64| t.min(timestamp)));
        session.last_ts = Some(session.last_ts.map_or(timestamp, |t: i64| t.max(timestamp)));

        let Some(message) = entry.message else {
            continue;
        };
        let Some(uuid) = entry.uuid else {
            result.parse_errors += 1;
            continue;
        };

        let role = message
            .role
            .clone()
            .unwrap_or_else(|| message_type.as_str().to_string());
        let is_sidechain = entry.is_sidechain.unwrap_or(false);

        let mut text_parts: Vec<String> = Vec::new();

        match &message.content {
            serde_json::Value::String(text) => text_parts.push(text.clone()),
            serde_json::Value::Array(blocks) => {
                for block in blocks {
                    let Ok(cb) = serde_json::from_value::<ContentBlock>(block.clone()) else {
                        result.parse_errors += 1;
                        continue;
                    };
                    match cb.block_type.as_deref() {
                        Some("text") => {
                            if let Some(text) = cb.text {
                                text_parts.push(text);
                            }
                        }
                        Some("thinking") => {
                            result.thinking_blocks.push(NewThinkingBlock {
                                conversation_external_id: session_id.clone(),
                                message_external_id: uuid.clone(),
                                thinking_content: cb.thinking.unwrap_or_default(),
                                signature: cb.signature,
                                timestamp,
                            });
                        }
                        Some("tool_use") => {
                            let input = cb.input.unwrap_or(serde_json::Value::Null);
                            let tool_name = cb.name.unwrap_or_default();
                            if let Some(edit_type) = file_edit_kind(&tool_name) {
                                if let Some(file_path) = file_path_from_input(&input) {
                                    result.file_edits.push(NewFileEdit {
                                        conversation_external_id: session_id.clone(),
                                        file_path,
                                        edit_type: edit_type.to_string(),
                                        snapshot_timestamp: timestamp,
                                    });
                                }
                            }
                            result.tool_uses.push(NewToolUse {
                                conversation_external_id: session_id.clone(),
                                message_external_id: uuid.clone(),
                                external_id: cb.id.unwrap_or_else(|| format!("{uuid}-tool")),
                                tool_name,
                                tool_input_json: input.to_string(),
                                timestamp,
                            });
                        }
                        Some("tool_result") => {
                            let content = cb
                                .content
                                .map(flatten_result_content)
                                .unwrap_or_default();
                            let is_image = content.contains("data:image")
                                || block
                                    .get("content")
                                    .and_then(|c| c.as_array())
                                    .is_some_and(|items| {
                                        items.iter().any(|i| {
                                            i.get("type").and_then(|t| t.as_str()) == Some("image")
                                        })
                                    });
                            result.tool_results.push(NewToolResult {
                                conversation_external_id: session_id.clone(),
                                message_external_id: uuid.clone(),
                                tool_use_external_id: cb.tool_use_id,
                                content,
                                is_error: cb.is_error.unwrap_or(false),
                                stdout: None,
                                stderr: None,
                                is_image,
                                timestamp,
                            });
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        result.messages.push(NewMessage {
            conversation_external_id: session_id.clone(),
            external_id: uuid,
            parent_external_id: entry.parent_uuid,
            message_type,
            role,
            content: text_parts.join("\n"),
            timestamp,
            is_sidechain,
            metadata_json: None,
        });
    }

    // A file with lines but no recognisable session record is not a session.
    if sessions.is_empty() {
        if line_count > 0 && result.parse_errors == 0 {
            tracing::info!("File has no session header records, skipping");
            result.skipped_files += 1;
        }
        return result;
    }

    // Stable ordering within each conversation: (parsed_timestamp, file order).
    result
        .messages
        .sort_by(|a, b| {
            a.conversation_external_id
                .cmp(&b.conversation_external_id)
                .then(a.timestamp.cmp(&b.timestamp))
        });

    let mut session_ids: Vec<_> = sessions.keys().cloned().collect();
    session_ids.sort();
    for session_id in session_ids {
        let acc = &sessions[&session_id];
        let (Some(first), Some(last)) = (acc.first_ts, acc.last_ts) else {
            continue;
        };
        let project_path = acc
            .project_path
            .clone()
            .or_else(|| fallback_project.map(|p| p.to_string()))
            .unwrap_or_else(|| "/unknown".to_string());
        result.conversations.push(NewConversation {
            source_type: SourceType::ClaudeCode,
            external_id: session_id,
            project_path,
            first_message_at: first,
            last_message_at: last,
            message_count: 0,
            git_branch: acc.git_branch.clone(),
            client_version: acc.client_version.clone(),
            metadata_json: None,
        });
    }

    result
}

/// Tool result content may be a plain string or an array of typed items.
fn flatten_result_content(content: serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
