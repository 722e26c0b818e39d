//! Citation markers in generated answers.
//!
//! Grounded answers cite numbered sources inline as `[1]`, `[2]`, ... The
//! strict-answer guardrail checks for at least one such marker.

use std::sync::LazyLock;

use regex::Regex;

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").expect("citation regex is valid"));

/// True when `text` cites at least one source number in `1..=source_count`.
pub fn has_citation_marker(text: &str, source_count: usize) -> bool {
    cited_sources(text)
        .into_iter()
        .any(|n| n >= 1 && n <= source_count)
}

/// Distinct source numbers cited in `text`, in first-seen order.
pub fn cited_sources(text: &str) -> Vec<usize> {
    let mut seen = Vec::new();
    for cap in CITATION_RE.captures_iter(text) {
        if let Ok(n) = cap[1].parse::<usize>() {
            if !seen.contains(&n) {
                seen.push(n);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_marker() {
        assert!(has_citation_marker("Paris is the capital [1].", 1));
        assert!(has_citation_marker("See [2] and [1]", 2));
    }

    #[test]
    fn test_out_of_range_marker_is_ignored() {
        assert!(!has_citation_marker("As stated [4].", 2));
        assert!(!has_citation_marker("Index [0]", 3));
    }

    #[test]
    fn test_no_marker() {
        assert!(!has_citation_marker("Paris is the capital.", 3));
        assert!(!has_citation_marker("array[i]", 3));
    }

    #[test]
    fn test_cited_sources_order() {
        assert_eq!(cited_sources("[3] then [1] then [3]"), vec![3, 1]);
    }
}
