// src/parser/codex.rs
// Parses Codex rollout JSONL session logs.
//
// Files live under <codex_root>/sessions/YYYY/MM/DD/rollout-<ts>-<uuid>.jsonl.
// Each line is {timestamp, type, payload}; session_meta carries cwd/git/CLI
// version, response_item carries the role/content payloads.

use super::{ParseResult, file_edit_kind, file_path_from_input, is_untouched, parse_timestamp_ms};
use crate::db::types::*;
use crate::error::{MnemoError, Result};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::Path;
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// Deserialization types (internal)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexRecord {
    SessionMeta(TimedRecord<SessionMetaPayload>),
    ResponseItem(TimedRecord<ResponseItemPayload>),
    EventMsg(serde_json::Value),
    TurnContext(serde_json::Value),
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct TimedRecord<P> {
    timestamp: Option<String>,
    payload: P,
}

#[derive(Deserialize)]
struct SessionMetaPayload {
    id: String,
    cwd: Option<String>,
    cli_version: Option<String>,
    #[serde(default)]
    git: Option<GitInfo>,
}

#[derive(Deserialize)]
struct GitInfo {
    #[serde(default)]
    branch: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseItemPayload {
    Message(MessagePayload),
    Reasoning(ReasoningPayload),
    FunctionCall(FunctionCallPayload),
    FunctionCallOutput(FunctionCallOutputPayload),
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct MessagePayload {
    role: String,
    content: Vec<MessageContent>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContent {
    InputText { text: String },
    OutputText { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ReasoningPayload {
    #[serde(default)]
    summary: Vec<SummaryText>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SummaryText {
    SummaryText { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct FunctionCallPayload {
    name: String,
    /// Arguments arrive JSON-encoded inside a string.
    arguments: Option<String>,
    call_id: Option<String>,
}

#[derive(Deserialize)]
struct FunctionCallOutputPayload {
    call_id: Option<String>,
    output: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse every rollout file under the Codex sessions root.
pub fn parse_codex_root(codex_root: &Path, last_indexed_ms: Option<i64>) -> Result<ParseResult> {
    let sessions = codex_root.join("sessions");
    if !sessions.exists() {
        return Err(MnemoError::NotFound(format!(
            "Codex sessions root not found: {}",
            sessions.display()
        )));
    }

    let mut result = ParseResult::default();
    result.indexed_folders.push(sessions.clone());

    let mut files: Vec<_> = WalkDir::new(&sessions)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "jsonl")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("rollout-"))
        })
        .collect();
    files.sort();

    for file in files {
        if is_untouched(&file, last_indexed_ms) {
            result.skipped_files += 1;
            continue;
        }
        match parse_rollout_file(&file) {
            Ok(file_result) => result.merge(file_result),
            Err(e) => {
                tracing::warn!(file = %file.display(), "Skipping rollout file: {}", e);
                result.skipped_files += 1;
            }
        }
    }
    Ok(result)
}

/// Parse one rollout JSONL file from disk.
pub fn parse_rollout_file(path: &Path) -> Result<ParseResult> {
    let file = std::fs::File::open(path)?;
    Ok(parse_rollout_lines(BufReader::new(file)))
}

/// Parse rollout JSONL entries from a string (used by tests).
pub fn parse_rollout_entries(data: &str) -> ParseResult {
    parse_rollout_lines(BufReader::new(data.as_bytes()))
}

fn parse_rollout_lines<R: BufRead>(reader: R) -> ParseResult {
    let mut result = ParseResult::default();

    let mut session_id: Option<String> = None;
    let mut project_path: Option<String> = None;
    let mut git_branch: Option<String> = None;
    let mut client_version: Option<String> = None;
    let mut first_ts: Option<i64> = None;
    let mut last_ts: Option<i64> = None;
    let mut last_valid_ts: Option<i64> = None;
    let mut line_idx = 0u64;
    let mut saw_lines = false;

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
        saw_lines = true;
        line_idx += 1;

        let record: CodexRecord = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(_) => {
                result.parse_errors += 1;
                continue;
            }
        };

        match record {
            CodexRecord::SessionMeta(meta) => {
                session_id = Some(meta.payload.id.clone());
                project_path = meta.payload.cwd.clone();
                client_version = meta.payload.cli_version.clone();
                git_branch = meta.payload.git.and_then(|g| g.branch);
                if let Some(ts) = meta.timestamp.as_deref().and_then(parse_timestamp_ms) {
                    last_valid_ts = Some(ts);
                    first_ts = Some(first_ts.map_or(ts, |t: i64| t.min(ts)));
                    last_ts = Some(last_ts.map_or(ts, |t: i64| t.max(ts)));
                }
            }
            CodexRecord::ResponseItem(item) => {
                let Some(session) = session_id.clone() else {
                    // Response items before the session_meta header carry no
                    // session identity; they cannot be attributed.
                    result.parse_errors += 1;
                    continue;
                };

                let parsed_ts = item.timestamp.as_deref().and_then(parse_timestamp_ms);
                let Some(timestamp) = parsed_ts.or(last_valid_ts) else {
                    tracing::debug!("Dropping Codex item with no usable timestamp");
                    continue;
                };
                if parsed_ts.is_some() {
                    last_valid_ts = parsed_ts;
                }
                first_ts = Some(first_ts.map_or(timestamp, |t: i64| t.min(timestamp)));
                last_ts = Some(last_ts.map_or(timestamp, |t: i64| t.max(timestamp)));

                // Line numbers are stable in append-only logs, so they make
                // deterministic external ids for items that carry none.
                let external_id = format!("l{line_idx}");

                match item.payload {
                    ResponseItemPayload::Message(message) => {
                        let text = message
                            .content
                            .iter()
                            .filter_map(|c| match c {
                                MessageContent::InputText { text }
                                | MessageContent::OutputText { text } => Some(text.as_str()),
                                MessageContent::Unknown => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        let message_type = match message.role.as_str() {
                            "user" => MessageType::User,
                            "assistant" => MessageType::Assistant,
                            _ => MessageType::System,
                        };
                        result.messages.push(NewMessage {
                            conversation_external_id: session.clone(),
                            external_id,
                            parent_external_id: None,
                            message_type,
                            role: message.role,
                            content: text,
                            timestamp,
                            is_sidechain: false,
                            metadata_json: None,
                        });
                    }
                    ResponseItemPayload::Reasoning(reasoning) => {
                        let text = reasoning.content.unwrap_or_else(|| {
                            reasoning
                                .summary
                                .iter()
                                .filter_map(|s| match s {
                                    SummaryText::SummaryText { text } => Some(text.as_str()),
                                    SummaryText::Unknown => None,
                                })
                                .collect::<Vec<_>>()
                                .join("\n")
                        });
                        // Reasoning needs a host message row so the block has
                        // an owner; synthesize an assistant message.
                        result.messages.push(NewMessage {
                            conversation_external_id: session.clone(),
                            external_id: external_id.clone(),
                            parent_external_id: None,
                            message_type: MessageType::Assistant,
                            role: "assistant".into(),
                            content: String::new(),
                            timestamp,
                            is_sidechain: false,
                            metadata_json: None,
                        });
                        result.thinking_blocks.push(NewThinkingBlock {
                            conversation_external_id: session,
                            message_external_id: external_id,
                            thinking_content: text,
                            signature: None,
                            timestamp,
                        });
                    }
                    ResponseItemPayload::FunctionCall(call) => {
                        let input: serde_json::Value = call
                            .arguments
                            .as_deref()
                            .and_then(|a| serde_json::from_str(a).ok())
                            .unwrap_or(serde_json::Value::Null);
                        if let Some(edit_type) = file_edit_kind(&call.name) {
                            if let Some(file_path) = file_path_from_input(&input) {
                                result.file_edits.push(NewFileEdit {
                                    conversation_external_id: session.clone(),
                                    file_path,
                                    edit_type: edit_type.to_string(),
                                    snapshot_timestamp: timestamp,
                                });
                            }
                        }
                        result.messages.push(NewMessage {
                            conversation_external_id: session.clone(),
                            external_id: external_id.clone(),
                            parent_external_id: None,
                            message_type: MessageType::Assistant,
                            role: "assistant".into(),
                            content: String::new(),
                            timestamp,
                            is_sidechain: false,
                            metadata_json: None,
                        });
                        result.tool_uses.push(NewToolUse {
                            conversation_external_id: session,
                            message_external_id: external_id.clone(),
                            external_id: call.call_id.unwrap_or(external_id),
                            tool_name: call.name,
                            tool_input_json: input.to_string(),
                            timestamp,
                        });
                    }
                    ResponseItemPayload::FunctionCallOutput(output) => {
                        let content = match output.output {
                            Some(serde_json::Value::String(s)) => s,
                            Some(other) => other
                                .get("content")
                                .and_then(|c| c.as_str())
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| other.to_string()),
                            None => String::new(),
                        };
                        result.messages.push(NewMessage {
                            conversation_external_id: session.clone(),
                            external_id: external_id.clone(),
                            parent_external_id: None,
                            message_type: MessageType::User,
                            role: "tool".into(),
                            content: String::new(),
                            timestamp,
                            is_sidechain: false,
                            metadata_json: None,
                        });
                        result.tool_results.push(NewToolResult {
                            conversation_external_id: session,
                            message_external_id: external_id,
                            tool_use_external_id: output.call_id,
                            content,
                            is_error: false,
                            stdout: None,
                            stderr: None,
                            is_image: false,
                            timestamp,
                        });
                    }
                    ResponseItemPayload::Unknown => {}
                }
            }
            CodexRecord::EventMsg(_) | CodexRecord::TurnContext(_) | CodexRecord::Unknown => {}
        }
    }

    let Some(session) = session_id else {
        if saw_lines && result.parse_errors == 0 {
            tracing::info!("Rollout file has no session_meta record, skipping");
            result.skipped_files += 1;
        }
        result.messages.clear();
        return result;
    };

    if let (Some(first), Some(last)) = (first_ts, last_ts) {
        result.conversations.push(NewConversation {
            source_type: SourceType::Codex,
            external_id: session,
            project_path: project_path.unwrap_or_else(|| "/unknown".to_string()),
            first_message_at: first,
            last_message_at: last,
            message_count: 0,
            git_branch,
            client_version,
            metadata_json: None,
        });
    }

    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
