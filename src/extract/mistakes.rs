// src/extract/mistakes.rs
// Recognises user-authored corrections that follow an assistant action and
// links each to the immediately preceding assistant message.
//
// Pattern library:
//   - flat negation: "no," / "nope" / "wrong" / "that's incorrect"
//   - breakage reports: "you broke X" / "that broke" / "this doesn't work"
//   - rollback asks: "actually, ..." / "undo that" / "revert"

use super::{ConversationView, mentioned_files};
use crate::db::types::Mistake;
use crate::util::truncate;
use regex::Regex;
use std::sync::LazyLock;

static CORRECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(no,|nope\b|wrong\b|that's (?:wrong|incorrect|not right)|that is (?:wrong|incorrect)|you broke|that broke|this broke|that did(?:n't| not) work|(?:this|that|it) doesn'?t work|actually,|undo that|revert that|not what I (?:asked|meant|wanted))",
    )
    .expect("valid regex")
});

/// How much of the corrected assistant message to keep as context.
const ACTION_EXCERPT_CHARS: usize = 300;

/// Extract mistake records from user corrections.
pub fn extract(view: &ConversationView) -> Vec<Mistake> {
    let mut mistakes = Vec::new();
    let mut last_assistant: Option<&crate::db::types::Message> = None;

    for message in &view.messages {
        match message.message_type.as_str() {
            "assistant" => last_assistant = Some(message),
            "user" => {
                if message.content.is_empty() {
                    continue;
                }
                let Some(caps) = CORRECTION.captures(&message.content) else {
                    continue;
                };
                // A correction with nothing to correct is just a statement.
                let Some(assistant) = last_assistant else {
                    continue;
                };

                let matched = caps[1].trim_end_matches(',').to_string();
                mistakes.push(Mistake {
                    id: 0,
                    conversation_id: view.conversation_id,
                    message_id: assistant.id,
                    mistake_text: matched,
                    correction_text: truncate(&message.content, 500),
                    assistant_action: Some(truncate(&assistant.content, ACTION_EXCERPT_CHARS)),
                    related_files: mentioned_files(&message.content),
                });
            }
            _ => {}
        }
    }

    mistakes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testutil::{message, view};

    #[test]
    fn test_correction_links_to_preceding_assistant() {
        let v = view(
            vec![
                message(1, "user", "please rename the function", 1000),
                message(2, "assistant", "Renamed process to handle in src/lib.rs", 1100),
                message(3, "user", "that's wrong, I wanted handle_event not handle", 1200),
            ],
            vec![],
        );
        let mistakes = extract(&v);
        assert_eq!(mistakes.len(), 1);
        assert_eq!(mistakes[0].message_id, 2);
        assert!(mistakes[0].correction_text.contains("handle_event"));
        assert!(mistakes[0]
            .assistant_action
            .as_deref()
            .is_some_and(|a| a.contains("Renamed")));
    }

    #[test]
    fn test_correction_without_prior_assistant_ignored() {
        let v = view(
            vec![message(1, "user", "no, start over from the design doc", 1000)],
            vec![],
        );
        assert!(extract(&v).is_empty());
    }

    #[test]
    fn test_plain_user_message_not_a_mistake() {
        let v = view(
            vec![
                message(1, "assistant", "Done.", 1000),
                message(2, "user", "great, now add tests", 1100),
            ],
            vec![],
        );
        assert!(extract(&v).is_empty());
    }

    #[test]
    fn test_breakage_report() {
        let v = view(
            vec![
                message(1, "assistant", "Updated the migration in src/db/schema.rs", 1000),
                message(2, "user", "you broke the build, src/db/schema.rs has a syntax error", 1100),
            ],
            vec![],
        );
        let mistakes = extract(&v);
        assert_eq!(mistakes.len(), 1);
        assert_eq!(mistakes[0].mistake_text, "you broke");
        assert_eq!(mistakes[0].related_files, vec!["src/db/schema.rs".to_string()]);
    }

    #[test]
    fn test_mid_message_negation_not_matched() {
        // The pattern is anchored: "no" buried inside a sentence is not a
        // correction.
        let v = view(
            vec![
                message(1, "assistant", "Done.", 1000),
                message(2, "user", "there is no need to hurry", 1100),
            ],
            vec![],
        );
        assert!(extract(&v).is_empty());
    }
}
