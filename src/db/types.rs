// src/db/types.rs
// Record types shared between the parsers, extractors, and storage manager.
//
// Transcript-side types carry string external ids; the storage manager
// resolves them to integer row ids at insert time, so no in-memory cycles
// exist between messages, tool uses, and tool results.

use serde::{Deserialize, Serialize};

/// Which client produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    ClaudeCode,
    Codex,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude-code" => Some(Self::ClaudeCode),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message author kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Assistant,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A conversation as parsed from a transcript, keyed by its session id.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub source_type: SourceType,
    pub external_id: String,
    pub project_path: String,
    pub first_message_at: i64,
    pub last_message_at: i64,
    pub message_count: i64,
    pub git_branch: Option<String>,
    pub client_version: Option<String>,
    pub metadata_json: Option<String>,
}

/// A message as parsed from a transcript.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Session external id of the owning conversation.
    pub conversation_external_id: String,
    pub external_id: String,
    pub parent_external_id: Option<String>,
    pub message_type: MessageType,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    pub is_sidechain: bool,
    pub metadata_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewToolUse {
    pub conversation_external_id: String,
    pub message_external_id: String,
    pub external_id: String,
    pub tool_name: String,
    pub tool_input_json: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct NewToolResult {
    pub conversation_external_id: String,
    pub message_external_id: String,
    /// External id of the tool use this result answers. May be unresolvable;
    /// such orphans are stored with a NULL foreign key and logged.
    pub tool_use_external_id: Option<String>,
    pub content: String,
    pub is_error: bool,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub is_image: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct NewThinkingBlock {
    pub conversation_external_id: String,
    pub message_external_id: String,
    pub thinking_content: String,
    pub signature: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct NewFileEdit {
    pub conversation_external_id: String,
    pub file_path: String,
    pub edit_type: String,
    pub snapshot_timestamp: i64,
}

/// Stored conversation row.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub project_id: Option<i64>,
    pub project_path: String,
    pub source_type: String,
    pub external_id: String,
    pub first_message_at: i64,
    pub last_message_at: i64,
    pub message_count: i64,
    pub git_branch: Option<String>,
    pub client_version: Option<String>,
}

/// Stored message row.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub external_id: String,
    pub message_type: String,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    pub is_sidechain: bool,
}

/// An extracted decision, before or after storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub decision_text: String,
    pub rationale: Option<String>,
    pub alternatives_considered: Vec<String>,
    pub rejected_reasons: Vec<String>,
    pub related_files: Vec<String>,
    pub related_commits: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mistake {
    #[serde(default)]
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub mistake_text: String,
    pub correction_text: String,
    /// Content excerpt of the assistant message being corrected.
    pub assistant_action: Option<String>,
    pub related_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(default)]
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub requirement_text: String,
    pub kind: String,
    pub related_files: Vec<String>,
}

/// Problem-solving span derived from a conversation segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Methodology {
    #[serde(default)]
    pub id: i64,
    pub conversation_id: i64,
    pub start_message_id: Option<i64>,
    pub end_message_id: Option<i64>,
    pub problem: String,
    pub approach: String,
    pub steps: Vec<String>,
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitCommit {
    #[serde(default)]
    pub id: i64,
    pub project_id: i64,
    pub conversation_id: Option<i64>,
    pub hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
    pub branch: Option<String>,
    pub files_changed: Vec<String>,
}

/// Per-table row counts returned by `get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub projects: i64,
    pub conversations: i64,
    pub messages: i64,
    pub tool_uses: i64,
    pub tool_results: i64,
    pub thinking_blocks: i64,
    pub decisions: i64,
    pub mistakes: i64,
    pub requirements: i64,
    pub methodologies: i64,
    pub file_edits: i64,
    pub git_commits: i64,
    pub working_memory: i64,
    pub message_vectors: i64,
    pub decision_vectors: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_round_trip() {
        assert_eq!(SourceType::parse("claude-code"), Some(SourceType::ClaudeCode));
        assert_eq!(SourceType::parse("codex"), Some(SourceType::Codex));
        assert_eq!(SourceType::parse("zed"), None);
        assert_eq!(SourceType::ClaudeCode.as_str(), "claude-code");
    }

    #[test]
    fn test_message_type_parse() {
        assert_eq!(MessageType::parse("assistant"), Some(MessageType::Assistant));
        assert_eq!(MessageType::parse("tool"), None);
    }
}
