// src/extract/methodology.rs
// Segments a conversation into problem-solving spans and classifies how
// each span was worked: a span opens at a user problem statement, closes at
// a success/failure signal, and records the ordered tool steps in between.

use super::{ConversationView, ToolUseView};
use crate::db::types::{Message, Methodology};
use crate::util::truncate;
use regex::Regex;
use std::sync::LazyLock;

static PROBLEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(fix|bug|broken|fails?|failing|error|crash|implement|add|build|create|refactor|rename|clean up|investigate|why (?:does|is)|how (?:do|can) (?:I|we)|write tests?)\b",
    )
    .expect("valid regex")
});

static SUCCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(works now|that works|it works|fixed|passes|passing|all green|perfect|thanks?|lgtm|done|ship it)\b")
        .expect("valid regex")
});

static FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(still (?:broken|failing|fails)|gave up|giving up|doesn'?t work|worse|no luck)\b")
        .expect("valid regex")
});

/// Approach classes, matched in priority order against the problem wording.
static WORDING_CLASSES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\b(refactor|rename|clean up|restructure)\b", "refactoring"),
        (r"(?i)\b((?:write|add) tests?|test coverage|unit tests?)\b", "testing"),
        (r"(?i)\b(fix|bug|broken|fails?|failing|error|crash)\b", "debugging"),
        (r"(?i)\b(implement|add|build|create)\b", "implementation"),
        (r"(?i)\b(investigate|why (?:does|is)|how (?:do|can))\b", "exploration"),
    ]
    .into_iter()
    .map(|(pattern, class)| (Regex::new(pattern).expect("valid regex"), class))
    .collect()
});

/// Extract methodology records from a conversation.
pub fn extract(view: &ConversationView) -> Vec<Methodology> {
    let mut methodologies = Vec::new();
    let mut open_span: Option<(usize, &Message)> = None;

    for (idx, message) in view.messages.iter().enumerate() {
        let is_user = message.message_type == "user";

        if open_span.is_none() {
            if is_user && PROBLEM.is_match(&message.content) {
                open_span = Some((idx, message));
            }
            continue;
        }

        let succeeded = SUCCESS.is_match(&message.content);
        let failed = FAILURE.is_match(&message.content);
        if !succeeded && !failed {
            continue;
        }
        // Ignore the opening message itself echoing a terminator word.
        let Some((start_idx, start_message)) = open_span.take() else {
            continue;
        };
        if idx == start_idx {
            open_span = Some((start_idx, start_message));
            continue;
        }

        let end_message = message;
        let steps = steps_in_span(view, start_message.timestamp, end_message.timestamp);
        let outcome = if failed { "failure" } else { "success" };

        methodologies.push(Methodology {
            id: 0,
            conversation_id: view.conversation_id,
            start_message_id: Some(start_message.id),
            end_message_id: Some(end_message.id),
            problem: truncate(&start_message.content, 300),
            approach: classify(&start_message.content, &steps),
            steps,
            outcome: outcome.to_string(),
        });
    }

    methodologies
}

/// Ordered tool names used inside a span, consecutive duplicates collapsed.
fn steps_in_span(view: &ConversationView, start_ts: i64, end_ts: i64) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    for tool_use in &view.tool_uses {
        if tool_use.timestamp < start_ts || tool_use.timestamp > end_ts {
            continue;
        }
        if steps.last().map(String::as_str) != Some(tool_use.tool_name.as_str()) {
            steps.push(tool_use.tool_name.clone());
        }
    }
    steps
}

/// Classify the approach from problem wording, falling back to the dominant
/// tool family when the wording is neutral.
fn classify(problem: &str, steps: &[String]) -> String {
    for (re, class) in WORDING_CLASSES.iter() {
        if re.is_match(problem) {
            return (*class).to_string();
        }
    }
    dominant_tool_class(steps).to_string()
}

fn dominant_tool_class(steps: &[String]) -> &'static str {
    let mut reads = 0usize;
    let mut writes = 0usize;
    let mut web = 0usize;
    let mut tests = 0usize;
    for step in steps {
        match step.as_str() {
            "Read" | "Grep" | "Glob" | "LS" => reads += 1,
            "Edit" | "MultiEdit" | "Write" | "NotebookEdit" => writes += 1,
            "WebSearch" | "WebFetch" => web += 1,
            _ if step.to_lowercase().contains("test") => tests += 1,
            _ => {}
        }
    }
    if web > 0 && web >= reads && web >= writes {
        "research"
    } else if tests > 0 && tests >= writes {
        "testing"
    } else if writes > reads {
        "implementation"
    } else {
        "exploration"
    }
}
