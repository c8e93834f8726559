// src/search/snippet.rs
// Query-aware snippet generation.
//
// A window of target_length characters slides over the content in 10-char
// steps; windows are scored 2 per full term match, 1 per partial match,
// +0.5 when the window opens at a sentence boundary. The best window is
// word-aligned outward and optionally highlighted.

/// Window step in characters.
const STEP: usize = 10;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "what", "when", "where", "which", "with",
];

/// Snippet generation settings.
#[derive(Debug, Clone)]
pub struct SnippetConfig {
    pub target_length: usize,
    pub highlight: bool,
    pub highlight_pre: String,
    pub highlight_post: String,
}

impl Default for SnippetConfig {
    fn default() -> Self {
        Self {
            target_length: 200,
            highlight: true,
            highlight_pre: "**".to_string(),
            highlight_post: "**".to_string(),
        }
    }
}

/// A term occurrence inside the content.
#[derive(Debug, Clone, Copy)]
struct Occurrence {
    start: usize,
    end: usize,
    /// Whole-word match (word boundaries on both sides).
    full: bool,
}

/// Build a query-aware snippet of `content`.
pub fn generate_snippet(content: &str, query: &str, config: &SnippetConfig) -> String {
    if content.is_empty() {
        return String::new();
    }

    let terms = query_terms(query);
    let occurrences = find_occurrences(content, &terms);

    if occurrences.is_empty() {
        return leading_snippet(content, config.target_length);
    }

    let (window_start, window_end) = best_window(content, &occurrences, config.target_length);
    let (start, end) = widen_to_whitespace(content, window_start, window_end);

    let mut snippet = content[start..end].to_string();
    if config.highlight {
        snippet = highlight_terms(&snippet, &terms, config);
    }

    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(snippet.trim());
    if end < content.len() {
        out.push_str("...");
    }
    out
}

/// Query terms: ≥ 2 chars, stop words removed, lowercased, longest first so
/// highlighting never nests a shorter term inside a longer one.
fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.len() >= 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect();
    terms.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    terms.dedup();
    terms
}

/// All case-insensitive occurrences of every term.
fn find_occurrences(content: &str, terms: &[String]) -> Vec<Occurrence> {
    // Lowercasing changes byte lengths for a handful of scripts; offsets
    // must index into the original, so fall back to exact matching there.
    let lowered = lowercase_same_len(content);
    let mut occurrences = Vec::new();

    for term in terms {
        let mut from = 0usize;
        while let Some(found) = lowered[from..].find(term.as_str()) {
            let start = from + found;
            let end = start + term.len();
            let before_ok = start == 0
                || !lowered[..start]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric());
            let after_ok = end >= lowered.len()
                || !lowered[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
            occurrences.push(Occurrence {
                start,
                end,
                full: before_ok && after_ok,
            });
            from = end;
        }
    }
    occurrences.sort_by_key(|o| o.start);
    occurrences
}

/// Slide a target_length window in STEP-char increments; return the best
/// scoring [start, end) byte range.
fn best_window(content: &str, occurrences: &[Occurrence], target_length: usize) -> (usize, usize) {
    if content.len() <= target_length {
        return (0, content.len());
    }

    let mut best_start = 0usize;
    let mut best_score = f64::MIN;
    let mut pos = 0usize;

    while pos + target_length <= content.len() + STEP {
        let start = floor_boundary(content, pos.min(content.len()));
        let end = floor_boundary(content, (start + target_length).min(content.len()));

        let mut score = 0.0;
        for occ in occurrences {
            if occ.start >= start && occ.end <= end {
                score += if occ.full { 2.0 } else { 1.0 };
            }
        }
        if at_sentence_start(content, start) {
            score += 0.5;
        }

        if score > best_score {
            best_score = score;
            best_start = start;
        }
        pos += STEP;
    }

    let end = floor_boundary(content, (best_start + target_length).min(content.len()));
    (best_start, end)
}

/// Does the window open at, or just after, a sentence boundary?
fn at_sentence_start(content: &str, start: usize) -> bool {
    if start == 0 {
        return true;
    }
    let before = content[..start].trim_end();
    before.ends_with(['.', '!', '?', '\n'])
}

/// Snap window edges outward to the nearest whitespace.
fn widen_to_whitespace(content: &str, mut start: usize, mut end: usize) -> (usize, usize) {
    while start > 0 {
        let prev = content[..start].chars().next_back().unwrap_or(' ');
        if prev.is_whitespace() {
            break;
        }
        start -= prev.len_utf8();
    }
    while end < content.len() {
        let next = content[end..].chars().next().unwrap_or(' ');
        if next.is_whitespace() {
            break;
        }
        end += next.len_utf8();
    }
    (start, end)
}

/// Leading fallback when the content has no term hits: first target_length
/// characters, word-aligned, with a trailing ellipsis when truncated.
fn leading_snippet(content: &str, target_length: usize) -> String {
    if content.len() <= target_length {
        return content.to_string();
    }
    let mut end = floor_boundary(content, target_length);
    while end > 0 {
        let prev = content[..end].chars().next_back().unwrap_or(' ');
        if prev.is_whitespace() {
            break;
        }
        end -= prev.len_utf8();
    }
    if end == 0 {
        end = floor_boundary(content, target_length);
    }
    format!("{}...", content[..end].trim_end())
}

/// Wrap each term occurrence with the configured delimiters. Terms arrive
/// longest-first from query_terms, which prevents nested highlighting.
fn highlight_terms(snippet: &str, terms: &[String], config: &SnippetConfig) -> String {
    let mut out = snippet.to_string();
    for term in terms {
        let lowered = lowercase_same_len(&out);
        let mut rebuilt = String::with_capacity(out.len());
        let mut from = 0usize;
        while let Some(found) = lowered[from..].find(term.as_str()) {
            let start = from + found;
            let end = start + term.len();
            // Skip matches already inside a highlight.
            let already = out[..start].ends_with(config.highlight_pre.as_str());
            rebuilt.push_str(&out[from..start]);
            if already {
                rebuilt.push_str(&out[start..end]);
            } else {
                rebuilt.push_str(&config.highlight_pre);
                rebuilt.push_str(&out[start..end]);
                rebuilt.push_str(&config.highlight_post);
            }
            from = end;
        }
        rebuilt.push_str(&out[from..]);
        out = rebuilt;
    }
    out
}

/// Lowercase while keeping byte offsets valid for the original string.
fn lowercase_same_len(text: &str) -> String {
    let lowered = text.to_lowercase();
    if lowered.len() == text.len() {
        lowered
    } else {
        text.to_string()
    }
}

fn floor_boundary(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SnippetConfig {
        SnippetConfig::default()
    }

    fn plain_config() -> SnippetConfig {
        SnippetConfig {
            highlight: false,
            ..SnippetConfig::default()
        }
    }

    #[test]
    fn test_short_content_returned_whole() {
        let snippet = generate_snippet("short text about postgres", "postgres", &plain_config());
        assert_eq!(snippet, "short text about postgres");
    }

    #[test]
    fn test_window_centers_on_matches() {
        let mut content = "filler sentence without the word. ".repeat(20);
        content.push_str("The postgres connection pool was exhausted under load.");
        content.push_str(&" trailing filler sentence here.".repeat(20));

        let snippet = generate_snippet(&content, "postgres pool", &plain_config());
        assert!(snippet.contains("postgres"), "snippet was: {snippet}");
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn test_no_hits_leading_window() {
        let content = "word ".repeat(200);
        let snippet = generate_snippet(&content, "zebra", &plain_config());
        assert!(snippet.ends_with("..."));
        assert!(snippet.len() <= 200 + 3);
        // Word-aligned: never cuts a word in half.
        assert!(!snippet.trim_end_matches("...").ends_with("wor"));
    }

    #[test]
    fn test_highlighting_wraps_terms() {
        let snippet = generate_snippet(
            "the parser failed on bad utf8 input",
            "parser utf8",
            &config(),
        );
        assert!(snippet.contains("**parser**"));
        assert!(snippet.contains("**utf8**"));
    }

    #[test]
    fn test_highlight_longest_first_no_nesting() {
        // "configuration" contains "config": the longer term wins and the
        // shorter must not produce a nested highlight inside it.
        let snippet = generate_snippet(
            "read the configuration and the config file",
            "configuration config",
            &config(),
        );
        assert!(snippet.contains("**configuration**"), "snippet: {snippet}");
        assert!(!snippet.contains("****"));
    }

    #[test]
    fn test_case_insensitive_matching() {
        let snippet = generate_snippet("The Parser crashed.", "parser", &config());
        assert!(snippet.contains("**Parser**"));
    }

    #[test]
    fn test_short_terms_and_stop_words_ignored() {
        let snippet = generate_snippet("a big file on disk", "a on x", &plain_config());
        // No usable terms: leading fallback, content short so returned whole.
        assert_eq!(snippet, "a big file on disk");
    }

    #[test]
    fn test_ellipses_only_where_interior() {
        let content = format!("postgres first here. {}", "filler words all over. ".repeat(30));
        let snippet = generate_snippet(&content, "postgres", &plain_config());
        assert!(!snippet.starts_with("..."), "window at content start: {snippet}");
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn test_multibyte_safe() {
        let content = format!("préfix ünïcode {} postgres ends", "füller wörds ".repeat(40));
        let snippet = generate_snippet(&content, "postgres", &plain_config());
        assert!(snippet.contains("postgres"));
    }
}
