//! Query classification for retrieval strategy selection.
//!
//! The classifier looks at the raw question and the names of the sources a
//! scope can see, and picks one of four strategies. Rules are evaluated in
//! order and the first match wins:
//!
//! 1. [`QueryType::Specific`]: the question names a known source, by file
//!    name or by its extension-stripped base name.
//! 2. [`QueryType::Comparative`]: comparison vocabulary ("compare",
//!    "difference", "versus", "both documents", "second file", ...).
//! 3. [`QueryType::Reference`]: anaphora pointing at an implicit document
//!    ("this", "that file", a bare "summarize").
//! 4. [`QueryType::General`]: everything else.
//!
//! Naming a document is the strongest signal, so it beats comparison and
//! reference vocabulary.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static COMPARATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \b(compare|compared|comparing|comparison|contrast|difference|differences|differ|versus|vs)\b
        | \bboth\s+(documents?|files?|sources?|pdfs?|papers?)\b
        | \b(first|second|third|fourth|other|last|1st|2nd|3rd|4th)\s+(document|file|doc|source|pdf|paper)\b
        | \bbetween\s+(the\s+)?(two|these|those|all)\b
        ",
    )
    .expect("comparative regex is valid")
});

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \b(this|that|these|those)\s+(document|file|doc|pdf|paper|article|upload|attachment|link|video|audio|recording|text|page)s?\b
        | \bthe\s+(attached|uploaded|last|latest)\s+(document|file|doc|pdf|paper|link|video)\b
        | ^\s*(summarize|summarise|explain|describe|recap|tl;?dr)(\s+(it|this|that))?\s*[.!?]*\s*$
        | \b(summarize|summarise|explain|describe)\s+(this|that|it)\b
        | \bwhat\s+(is|does)\s+(this|it)\s+(about|say|mean)\b
        ",
    )
    .expect("reference regex is valid")
});

/// Source base names shorter than this are only matched by full file name.
const MIN_BASE_NAME_CHARS: usize = 3;

/// Retrieval strategy chosen for a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Specific,
    Reference,
    Comparative,
    General,
}

/// Classifier output: the strategy plus the named source for `Specific`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub query_type: QueryType,
    pub source_name: Option<String>,
}

impl Classification {
    fn of(query_type: QueryType) -> Self {
        Self {
            query_type,
            source_name: None,
        }
    }
}

/// Classify `question` against `source_names` (most recent first).
pub fn classify(question: &str, source_names: &[String]) -> Classification {
    let lower = question.to_lowercase();

    if let Some(name) = find_named_source(&lower, source_names) {
        return Classification {
            query_type: QueryType::Specific,
            source_name: Some(name),
        };
    }
    if COMPARATIVE_RE.is_match(&lower) {
        return Classification::of(QueryType::Comparative);
    }
    if REFERENCE_RE.is_match(&lower) {
        return Classification::of(QueryType::Reference);
    }
    Classification::of(QueryType::General)
}

/// Longest source name mentioned in `lower_question`; recency breaks ties.
fn find_named_source(lower_question: &str, source_names: &[String]) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for name in source_names {
        let full = name.to_lowercase();
        let matched_len = if !full.is_empty() && lower_question.contains(&full) {
            Some(full.len())
        } else {
            let base = strip_extension(&full);
            (base.chars().count() >= MIN_BASE_NAME_CHARS && lower_question.contains(base))
                .then_some(base.len())
        };
        if let Some(len) = matched_len {
            if best.map_or(true, |(_, l)| len > l) {
                best = Some((name, len));
            }
        }
    }
    best.map(|(name, _)| name.clone())
}

/// `"report.final.pdf"` → `"report.final"`; names without a dot are unchanged.
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}
