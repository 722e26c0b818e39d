//! Detection of "what sources do you have" questions.
//!
//! In strict mode these are answered from the index metadata alone, without
//! retrieval or a model call.

use std::sync::LazyLock;

use regex::Regex;

static SOURCE_LISTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^\s*(list|show|name)(\s+me)?\s+(your|the|all|all\s+the|my|available)\s+(documents|files|sources|uploads|materials|docs)\b
        | \b(what|which)\s+(documents|files|sources|uploads|materials|docs|knowledge)\s+(do|did|can)\s+(you|i)\s+(have|has|got|know|see|access|use|upload|uploaded)\b
        | \bwhat\s+(documents|files|sources|docs)\s+(are|were)\s+(available|uploaded|loaded|indexed)\b
        | \bwhat\s+(do\s+you\s+have|have\s+i\s+uploaded|did\s+i\s+upload)\s*[?.!]*\s*$
        | \bwhat\s+are\s+your\s+sources\b
        ",
    )
    .expect("source listing regex is valid")
});

/// Returns true when the question asks which sources the bot can draw on.
pub fn is_source_listing_question(question: &str) -> bool {
    SOURCE_LISTING_RE.is_match(&question.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_questions() {
        for q in [
            "What documents do you have?",
            "which files can you see",
            "List your sources",
            "show me all the documents",
            "What sources do you have access to?",
            "what files were uploaded",
            "What do you have?",
            "what are your sources?",
        ] {
            assert!(is_source_listing_question(q), "{q}");
        }
    }

    #[test]
    fn test_ordinary_questions() {
        for q in [
            "What is the capital of France?",
            "What do you have to say about taxes?",
            "summarize the documents",
            "Which document mentions the deadline?",
        ] {
            assert!(!is_source_listing_question(q), "{q}");
        }
    }
}
