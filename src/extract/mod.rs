// src/extract/mod.rs
// Extractors deriving decision, mistake, requirement, and methodology
// records from stored conversations. All extractors are pure and
// deterministic: identical input produces identical output, and unmatched
// text simply emits no record.

pub mod decisions;
pub mod methodology;
pub mod mistakes;
pub mod requirements;

use crate::db::types::Message;

/// A tool invocation as seen by the extractors.
#[derive(Debug, Clone)]
pub struct ToolUseView {
    pub message_id: i64,
    pub tool_name: String,
    pub timestamp: i64,
}

/// One stored conversation presented to the extractors: messages ordered by
/// (timestamp, id), tool uses ordered by timestamp.
#[derive(Debug, Clone)]
pub struct ConversationView {
    pub conversation_id: i64,
    pub messages: Vec<Message>,
    pub tool_uses: Vec<ToolUseView>,
}

impl ConversationView {
    pub fn new(conversation_id: i64, messages: Vec<Message>, tool_uses: Vec<ToolUseView>) -> Self {
        Self {
            conversation_id,
            messages,
            tool_uses,
        }
    }
}

/// Split prose into sentences at terminators, keeping non-empty trimmed parts.
pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    text.split_inclusive(['.', '!', '?', '\n'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// First path-looking tokens mentioned in a text (used to fill related_files).
pub(crate) fn mentioned_files(text: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | '`' | '"')) {
        let token = token.trim_end_matches(['.', ':', ';']);
        let looks_like_path = token.contains('/') || token.contains('\\');
        let has_extension = token.rsplit_once('.').is_some_and(|(stem, ext)| {
            !stem.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic())
        });
        if (looks_like_path || has_extension)
            && !token.starts_with("http")
            && token.len() > 3
            && !files.iter().any(|f| f == token)
        {
            files.push(token.to_string());
        }
        if files.len() >= 8 {
            break;
        }
    }
    files
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::db::types::Message;

    pub fn message(id: i64, message_type: &str, content: &str, ts: i64) -> Message {
        Message {
            id,
            conversation_id: 1,
            external_id: format!("m{id}"),
            message_type: message_type.to_string(),
            role: message_type.to_string(),
            content: content.to_string(),
            timestamp: ts,
            is_sidechain: false,
        }
    }

    pub fn view(messages: Vec<Message>, tool_uses: Vec<ToolUseView>) -> ConversationView {
        ConversationView::new(1, messages, tool_uses)
    }
}
