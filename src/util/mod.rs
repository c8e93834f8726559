// src/util/mod.rs
// Path normalization, identifier validation, and search-input sanitisation.
// Everything that touches user-supplied paths or query text funnels through
// here before it reaches SQL or the filesystem.

use crate::error::{MnemoError, Result};
use std::fmt::Display;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension trait for Result to simplify error conversion to String.
pub trait ResultExt<T, E> {
    /// Convert the error type to String.
    fn str_err(self) -> std::result::Result<T, String>;
}

impl<T, E: Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn str_err(self) -> std::result::Result<T, String> {
        self.map_err(|e| e.to_string())
    }
}

/// Cooperative cancellation flag, checked at suspension points.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MnemoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert a Path to an owned String, replacing invalid UTF-8 with U+FFFD.
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Truncate a string to max length with ellipsis, respecting char boundaries.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Path prefixes that are never valid project roots.
const FORBIDDEN_PREFIXES: &[&str] = &[
    "/etc",
    "/sys",
    "/proc",
    r"C:\Windows",
    r"C:\Program Files",
    r"C:\ProgramData",
    r"C:\System",
];

/// Validate and normalise a project path.
///
/// Rejects `..` traversal and system-directory prefixes before any side
/// effect happens. Trailing separators are stripped (except on the root).
pub fn sanitize_project_path(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(MnemoError::Validation("empty project path".into()));
    }

    if trimmed.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(MnemoError::Validation(format!(
            "path traversal rejected: {trimmed}"
        )));
    }

    for prefix in FORBIDDEN_PREFIXES {
        let matches = if prefix.starts_with('/') {
            trimmed == *prefix || trimmed.starts_with(&format!("{prefix}/"))
        } else {
            let lower = trimmed.to_lowercase();
            let p = prefix.to_lowercase();
            lower == p || lower.starts_with(&format!("{p}\\")) || lower.starts_with(&format!("{p}/"))
        };
        if matches {
            return Err(MnemoError::Validation(format!(
                "system directory rejected: {trimmed}"
            )));
        }
    }

    let mut normalized = trimmed.to_string();
    while normalized.len() > 1 && (normalized.ends_with('/') || normalized.ends_with('\\')) {
        normalized.pop();
    }
    Ok(normalized)
}

/// Derive the on-disk transcript folder name for a project path.
///
/// Path separators become `-` and a drive-letter colon is stripped, so
/// `/tmp/demo` maps to `-tmp-demo` and `C:\work\app` to `C-work-app`.
pub fn path_to_folder_name(project_path: &str) -> String {
    let without_colon: String = project_path.replacen(':', "", 1);
    without_colon
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect()
}

/// Score how plausibly `folder_name` encodes `project_path` (0.0..=1.0).
///
/// The folder mapping is lossy: `-` in a folder name may have been `/`, a
/// literal `-`, or (older clients) a `.`. Compared position by position
/// against the canonical encoding of `project_path`.
pub fn folder_name_similarity(folder_name: &str, project_path: &str) -> f64 {
    let expected = path_to_folder_name(project_path);
    let a: Vec<char> = folder_name.chars().collect();
    let b: Vec<char> = expected.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let len = a.len().max(b.len());
    let mut matched = 0usize;
    for i in 0..len {
        match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) if x == y => matched += 1,
            (Some('-'), Some('.')) | (Some('.'), Some('-')) => matched += 1,
            _ => {}
        }
    }
    matched as f64 / len as f64
}

/// Reconstruct the most likely project path from a transcript folder name.
///
/// Every `-` is mapped back to `/`; this is the canonical reverse and is
/// only a candidate, not an exact inverse (dashes and dots in the original
/// path are indistinguishable from separators).
pub fn folder_name_to_path(folder_name: &str) -> String {
    folder_name
        .chars()
        .map(|c| if c == '-' { '/' } else { c })
        .collect()
}

/// Escape a string for use inside a `LIKE ? ESCAPE '\'` expression.
///
/// Backslash-escapes `\`, `%`, `_` and `"` so the pattern matches only
/// literal occurrences of the input.
pub fn sanitize_for_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Quote user input for an FTS5 MATCH expression.
///
/// Each whitespace-separated term is wrapped in double quotes (internal
/// quotes doubled) so FTS operators in the input are treated literally.
pub fn fts_match_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an OR-of-phrases FTS5 MATCH expression from keywords.
pub fn fts_or_query(keywords: &[String]) -> String {
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .map(|k| format!("\"{}\"", k.trim().replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Validate an external identifier (session id, uuid, commit hash).
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(MnemoError::Validation(format!(
            "identifier length out of range: {}",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(MnemoError::Validation(format!("invalid identifier: {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_to_folder_name_unix() {
        assert_eq!(path_to_folder_name("/tmp/demo"), "-tmp-demo");
        assert_eq!(path_to_folder_name("/home/user/my-app"), "-home-user-my-app");
    }

    #[test]
    fn test_path_to_folder_name_windows() {
        assert_eq!(path_to_folder_name(r"C:\work\app"), "C-work-app");
    }

    #[test]
    fn test_folder_name_round_trip() {
        let path = "/home/user/project";
        let folder = path_to_folder_name(path);
        assert_eq!(folder_name_to_path(&folder), path);
    }

    #[test]
    fn test_folder_name_similarity_exact() {
        assert_eq!(folder_name_similarity("-tmp-demo", "/tmp/demo"), 1.0);
    }

    #[test]
    fn test_folder_name_similarity_dot_dash_fuzz() {
        // `/srv/app.rs` encodes to `-srv-app.rs`; an older client that also
        // dashed dots produced `-srv-app-rs`, which should still score high.
        let score = folder_name_similarity("-srv-app-rs", "/srv/app.rs");
        assert!(score > 0.9, "score was {score}");
    }

    #[test]
    fn test_folder_name_similarity_mismatch() {
        let score = folder_name_similarity("-completely-other", "/tmp/demo");
        assert!(score < 0.5);
    }

    #[test]
    fn test_sanitize_project_path_rejects_traversal() {
        assert!(sanitize_project_path("/tmp/../etc/passwd").is_err());
        assert!(sanitize_project_path("..").is_err());
    }

    #[test]
    fn test_sanitize_project_path_rejects_system_dirs() {
        assert!(sanitize_project_path("/etc").is_err());
        assert!(sanitize_project_path("/proc/self").is_err());
        assert!(sanitize_project_path(r"C:\Windows\System32").is_err());
        assert!(sanitize_project_path(r"c:\program files\thing").is_err());
    }

    #[test]
    fn test_sanitize_project_path_allows_similar_names() {
        // Prefix match must be on path segments, not raw strings.
        assert!(sanitize_project_path("/etcetera/app").is_ok());
        assert!(sanitize_project_path("/sysadmin-tools").is_ok());
    }

    #[test]
    fn test_sanitize_project_path_strips_trailing_slash() {
        assert_eq!(sanitize_project_path("/tmp/demo/").unwrap(), "/tmp/demo");
        assert_eq!(sanitize_project_path("/").unwrap(), "/");
    }

    #[test]
    fn test_sanitize_for_like_escapes_wildcards() {
        assert_eq!(sanitize_for_like("50%_done"), "50\\%\\_done");
        assert_eq!(sanitize_for_like(r"a\b"), r"a\\b");
        assert_eq!(sanitize_for_like("say \"hi\""), "say \\\"hi\\\"");
        assert_eq!(sanitize_for_like("plain"), "plain");
    }

    #[test]
    fn test_fts_match_query_quotes_terms() {
        assert_eq!(fts_match_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(fts_match_query("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_fts_or_query() {
        let q = fts_or_query(&["postgres".to_string(), "redis cache".to_string()]);
        assert_eq!(q, "\"postgres\" OR \"redis cache\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("sess-123_ok.v2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier("semi;colon").is_err());
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello...");
        // Multi-byte char straddling the cut must not panic.
        let s = "héllo wörld";
        let t = truncate(s, 2);
        assert!(t.ends_with("..."));
    }
}
