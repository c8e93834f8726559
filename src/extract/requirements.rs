// src/extract/requirements.rs
// Recognises user-authored constraints and imperatives.
//
// Pattern library:
//   - hard constraints: "must", "must not", "never", "always"
//   - guarded imperatives: "make sure", "ensure that", "don't forget to"

use super::{ConversationView, mentioned_files, split_sentences};
use crate::db::types::Requirement;
use regex::Regex;
use std::sync::LazyLock;

static CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(must(?: not)?|never|always|should (?:always|never))\b").expect("valid regex")
});

static IMPERATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(make sure|ensure that|don'?t forget to|remember to)\b").expect("valid regex")
});

/// Minimum sentence length worth recording; shorter ones lack substance.
const MIN_SENTENCE_CHARS: usize = 12;

/// Extract requirement records from user messages.
pub fn extract(view: &ConversationView) -> Vec<Requirement> {
    let mut requirements = Vec::new();

    for message in &view.messages {
        if message.message_type != "user" || message.content.is_empty() {
            continue;
        }

        for sentence in split_sentences(&message.content) {
            if sentence.len() < MIN_SENTENCE_CHARS {
                continue;
            }
            let kind = if CONSTRAINT.is_match(sentence) {
                "constraint"
            } else if IMPERATIVE.is_match(sentence) {
                "imperative"
            } else {
                continue;
            };

            requirements.push(Requirement {
                id: 0,
                conversation_id: view.conversation_id,
                message_id: message.id,
                requirement_text: sentence.trim_end_matches(['.', '!']).to_string(),
                kind: kind.to_string(),
                related_files: mentioned_files(sentence),
            });
        }
    }

    requirements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testutil::{message, view};

    #[test]
    fn test_constraint_sentence() {
        let v = view(
            vec![message(1, "user", "The parser must never panic on bad input.", 1000)],
            vec![],
        );
        let reqs = extract(&v);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, "constraint");
        assert_eq!(reqs[0].requirement_text, "The parser must never panic on bad input");
    }

    #[test]
    fn test_imperative_sentence() {
        let v = view(
            vec![message(1, "user", "Make sure the backup lands in backups/ first.", 1000)],
            vec![],
        );
        let reqs = extract(&v);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, "imperative");
    }

    #[test]
    fn test_only_matching_sentences_recorded() {
        let content = "Thanks for the update. You must keep the API stable. Looks good otherwise.";
        let v = view(vec![message(1, "user", content, 1000)], vec![]);
        let reqs = extract(&v);
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].requirement_text.contains("API stable"));
    }

    #[test]
    fn test_assistant_messages_ignored() {
        let v = view(
            vec![message(1, "assistant", "You must run the migration first.", 1000)],
            vec![],
        );
        assert!(extract(&v).is_empty());
    }
}
