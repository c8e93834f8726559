// src/extract/decisions.rs
// Recognises assistant-authored decision statements.
//
// Pattern library:
//   - "I'll use X because Y" / "I will use X since Y" / "I'm going to use X"
//   - "Let's go with X" / "We should go with X"
//   - "I decided to X" / "I chose X (over|instead of|rather than) Y"
//   - enumerations: "Option A: ... Option B: ..." feed alternatives

use super::{ConversationView, mentioned_files, split_sentences};
use crate::db::types::Decision;
use regex::Regex;
use std::sync::LazyLock;

static USE_BECAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bI(?:'ll| will|'m going to) use ([^,.;\n]+?)\s+(?:because|since|as)\s+([^.;\n]+)",
    )
    .expect("valid regex")
});

static USE_PLAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bI(?:'ll| will|'m going to) use ([^,.;\n]+)").expect("valid regex")
});

static GO_WITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:let's|we should|we'll|I'll) go with ([^,.;\n]+)").expect("valid regex")
});

static DECIDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bI (?:decided to|chose to|opted to) ([^,.;\n]+)").expect("valid regex")
});

static REJECTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:instead of|rather than|over) ([^,.;\n]+)").expect("valid regex")
});

static OPTION_ENUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\boption ([A-Z0-9]+)\s*[:\-]\s*([^.;\n]+)").expect("valid regex"));

/// Extract decision records from assistant messages.
pub fn extract(view: &ConversationView) -> Vec<Decision> {
    let mut decisions = Vec::new();

    for message in &view.messages {
        if message.message_type != "assistant" || message.content.is_empty() {
            continue;
        }

        // Alternatives enumerated anywhere in the message apply to every
        // decision found in it.
        let enumerated: Vec<String> = OPTION_ENUM
            .captures_iter(&message.content)
            .map(|c| c[2].trim().to_string())
            .collect();

        for sentence in split_sentences(&message.content) {
            let (decision_text, rationale) = if let Some(caps) = USE_BECAUSE.captures(sentence) {
                (
                    format!("use {}", caps[1].trim()),
                    Some(caps[2].trim().to_string()),
                )
            } else if let Some(caps) = GO_WITH.captures(sentence) {
                (format!("go with {}", caps[1].trim()), None)
            } else if let Some(caps) = DECIDED.captures(sentence) {
                (caps[1].trim().to_string(), None)
            } else if let Some(caps) = USE_PLAIN.captures(sentence) {
                (format!("use {}", caps[1].trim()), None)
            } else {
                continue;
            };

            let mut alternatives = enumerated.clone();
            let mut rejected_reasons = Vec::new();
            for caps in REJECTED.captures_iter(sentence) {
                let alt = caps[1].trim().to_string();
                rejected_reasons.push(format!("rejected {alt}"));
                if !alternatives.contains(&alt) {
                    alternatives.push(alt);
                }
            }

            decisions.push(Decision {
                id: 0,
                conversation_id: view.conversation_id,
                message_id: message.id,
                decision_text,
                rationale,
                alternatives_considered: alternatives,
                rejected_reasons,
                related_files: mentioned_files(&message.content),
                related_commits: Vec::new(),
            });
        }
    }

    decisions
}
