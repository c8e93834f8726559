// src/search/expansion.rs
// Query expansion: synonym-based variants of the original query.
//
// Variants substitute one synonym per word while preserving word order; the
// original query is always variant 0.

use std::collections::HashMap;

/// Common English + query noise words dropped before synonym lookup.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "what", "when", "where", "which", "with",
];

/// Built-in domain synonym categories. Every word in a category expands to
/// the others in the same category.
const SYNONYM_CATEGORIES: &[&[&str]] = &[
    &["error", "exception", "failure", "bug", "crash"],
    &["api", "endpoint", "route", "interface"],
    &["database", "db", "sqlite", "storage", "store"],
    &["function", "method", "fn", "procedure"],
    &["auth", "authentication", "login", "credentials"],
    &["config", "configuration", "settings", "options"],
    &["test", "tests", "spec", "unittest"],
    &["delete", "remove", "drop", "forget"],
    &["search", "find", "query", "lookup"],
    &["slow", "performance", "latency", "perf"],
];

/// Synonym-driven query expander with an optional user overlay.
pub struct QueryExpander {
    synonyms: HashMap<String, Vec<String>>,
    max_variants: usize,
}

impl QueryExpander {
    pub fn new(max_variants: usize) -> Self {
        let mut synonyms: HashMap<String, Vec<String>> = HashMap::new();
        for category in SYNONYM_CATEGORIES {
            for &word in *category {
                let alternates: Vec<String> = category
                    .iter()
                    .filter(|&&w| w != word)
                    .map(|w| w.to_string())
                    .collect();
                synonyms.insert(word.to_string(), alternates);
            }
        }
        Self {
            synonyms,
            max_variants: max_variants.max(1),
        }
    }

    /// Layer user-provided synonyms over the built-in map. User entries are
    /// appended ahead of built-ins for their word.
    pub fn with_overlay(mut self, overlay: HashMap<String, Vec<String>>) -> Self {
        for (word, mut alternates) in overlay {
            let entry = self.synonyms.entry(word.to_lowercase()).or_default();
            alternates.extend(entry.clone());
            *entry = alternates;
        }
        self
    }

    /// Generate up to `max_variants` query variants, original first.
    pub fn expand(&self, query: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        if self.max_variants == 1 {
            return variants;
        }

        let words: Vec<&str> = query.split_whitespace().collect();

        // Substitute one word at a time, scanning words left to right and
        // their synonyms in order, so output is deterministic.
        'outer: for (idx, word) in words.iter().enumerate() {
            let lowered = word.to_lowercase();
            if STOP_WORDS.contains(&lowered.as_str()) {
                continue;
            }
            let Some(alternates) = self.synonyms.get(&lowered) else {
                continue;
            };
            for alternate in alternates {
                let mut variant_words: Vec<String> =
                    words.iter().map(|w| w.to_string()).collect();
                variant_words[idx] = alternate.clone();
                let variant = variant_words.join(" ");
                if !variants.contains(&variant) {
                    variants.push(variant);
                }
                if variants.len() >= self.max_variants {
                    break 'outer;
                }
            }
        }

        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_always_first() {
        let expander = QueryExpander::new(4);
        let variants = expander.expand("database error");
        assert_eq!(variants[0], "database error");
    }

    #[test]
    fn test_expansion_preserves_word_order() {
        let expander = QueryExpander::new(4);
        let variants = expander.expand("database error handling");
        for variant in &variants[1..] {
            let words: Vec<&str> = variant.split_whitespace().collect();
            assert_eq!(words.len(), 3);
            assert_eq!(words[2], "handling");
        }
    }

    #[test]
    fn test_max_variants_respected() {
        let expander = QueryExpander::new(3);
        let variants = expander.expand("database error");
        assert!(variants.len() <= 3);
        let single = QueryExpander::new(1);
        assert_eq!(single.expand("database error").len(), 1);
    }

    #[test]
    fn test_stop_words_not_expanded() {
        let expander = QueryExpander::new(5);
        // "in" is a stop word; no variant may replace it even if a user
        // overlay knew a synonym for it.
        let variants = expander.expand("error in handler");
        for variant in &variants {
            assert!(variant.contains("in"));
        }
    }

    #[test]
    fn test_no_synonyms_no_extra_variants() {
        let expander = QueryExpander::new(4);
        let variants = expander.expand("zanzibar xylophone");
        assert_eq!(variants, vec!["zanzibar xylophone".to_string()]);
    }

    #[test]
    fn test_user_overlay_takes_priority() {
        let mut overlay = HashMap::new();
        overlay.insert("widget".to_string(), vec!["gadget".to_string()]);
        let expander = QueryExpander::new(2).with_overlay(overlay);
        let variants = expander.expand("widget broken");
        assert_eq!(variants, vec!["widget broken".to_string(), "gadget broken".to_string()]);
    }

    #[test]
    fn test_deterministic() {
        let expander = QueryExpander::new(4);
        assert_eq!(expander.expand("db error"), expander.expand("db error"));
    }
}
