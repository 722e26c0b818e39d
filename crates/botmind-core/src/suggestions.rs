//! Separation of answer prose from the trailing suggestions block.
//!
//! The model is instructed to finish its answer with a separator token
//! followed by a JSON array of follow-up suggestions. While streaming, the
//! [`SuggestionSplitter`] forwards prose as soon as it is safe and captures
//! everything after the separator without ever releasing it as prose.
//!
//! Until the separator is seen, the last `separator.len() - 1` bytes of the
//! buffer are held back because they may be the start of a separator split
//! across two stream pieces. Memory stays bounded by the separator length
//! while prose streams.

/// Separator emitted by the model between the answer and its suggestions.
pub const DEFAULT_SEPARATOR: &str = "|||SUGGESTIONS|||";

/// At most this many suggestions are kept.
pub const MAX_SUGGESTIONS: usize = 3;

/// Incremental splitter over a stream of text pieces.
#[derive(Debug, Clone)]
pub struct SuggestionSplitter {
    separator: String,
    buffer: String,
    collecting: bool,
    suggestions: String,
}

/// What remains once the stream has ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitRemainder {
    /// Prose still held back when the stream ended.
    pub clean_tail: String,
    /// Raw text captured after the separator (empty if none was seen).
    pub suggestions_raw: String,
}

impl SuggestionSplitter {
    pub fn new(separator: &str) -> Self {
        Self {
            separator: separator.to_string(),
            buffer: String::new(),
            collecting: false,
            suggestions: String::new(),
        }
    }

    /// True once the separator has been seen.
    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Feed one stream piece. Returns prose that may be forwarded now.
    pub fn push(&mut self, piece: &str) -> Option<String> {
        if self.collecting {
            self.suggestions.push_str(piece);
            return None;
        }

        self.buffer.push_str(piece);

        if let Some(pos) = self.buffer.find(&self.separator) {
            let rest_start = pos + self.separator.len();
            self.suggestions.push_str(&self.buffer[rest_start..]);
            self.buffer.truncate(pos);
            self.collecting = true;
            let clean = std::mem::take(&mut self.buffer);
            return (!clean.is_empty()).then_some(clean);
        }

        let hold = self.separator.len().saturating_sub(1);
        if self.buffer.len() <= hold {
            return None;
        }
        let mut cut = self.buffer.len() - hold;
        while cut > 0 && !self.buffer.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            return None;
        }
        let flushed: String = self.buffer.drain(..cut).collect();
        Some(flushed)
    }

    /// End of stream: release held-back prose and the captured suggestions.
    pub fn finish(self) -> SplitRemainder {
        SplitRemainder {
            clean_tail: self.buffer,
            suggestions_raw: self.suggestions,
        }
    }
}

/// Split a complete (non-streamed) response at the first separator.
pub fn split_complete(text: &str, separator: &str) -> (String, String) {
    match text.find(separator) {
        Some(pos) => (
            text[..pos].to_string(),
            text[pos + separator.len()..].to_string(),
        ),
        None => (text.to_string(), String::new()),
    }
}

/// Parse a captured suggestions block into at most [`MAX_SUGGESTIONS`]
/// non-empty strings.
///
/// Surrounding code fences (```` ```json ... ``` ````) are stripped. An empty
/// block yields an empty list; malformed JSON is an error for the caller to
/// log and treat as no suggestions.
pub fn parse_suggestions(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    let body = strip_code_fence(raw.trim());
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: Vec<String> = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(err) => match (body.find('['), body.rfind(']')) {
            (Some(start), Some(end)) if start < end => serde_json::from_str(&body[start..=end])?,
            _ => return Err(err),
        },
    };

    Ok(parsed
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(MAX_SUGGESTIONS)
        .collect())
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pieces: &[&str]) -> (String, Vec<String>) {
        let mut splitter = SuggestionSplitter::new(DEFAULT_SEPARATOR);
        let mut clean = String::new();
        for p in pieces {
            if let Some(out) = splitter.push(p) {
                assert!(!out.contains("|||"), "separator leaked: {out:?}");
                clean.push_str(&out);
            }
        }
        let rest = splitter.finish();
        clean.push_str(&rest.clean_tail);
        (clean, parse_suggestions(&rest.suggestions_raw).unwrap())
    }

    #[test]
    fn test_separator_in_its_own_piece() {
        let (clean, sugg) = run(&["Context ", "|||SUGGESTIONS|||", r#"["Sug1"]"#]);
        assert_eq!(clean, "Context ");
        assert_eq!(sugg, vec!["Sug1".to_string()]);
    }

    #[test]
    fn test_separator_split_at_every_boundary() {
        let full = format!("Context {}{}", DEFAULT_SEPARATOR, r#"["Sug1"]"#);
        let sep_start = "Context ".len();
        for offset in 0..=DEFAULT_SEPARATOR.len() {
            let cut = sep_start + offset;
            let (clean, sugg) = run(&[&full[..cut], &full[cut..]]);
            assert_eq!(clean, "Context ", "cut at {cut}");
            assert_eq!(sugg, vec!["Sug1".to_string()], "cut at {cut}");
        }
    }

    #[test]
    fn test_character_by_character_stream() {
        let full = format!("Context {}{}", DEFAULT_SEPARATOR, r#"["Sug1"]"#);
        let pieces: Vec<String> = full.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = pieces.iter().map(|s| s.as_str()).collect();
        let (clean, sugg) = run(&refs);
        assert_eq!(clean, "Context ");
        assert_eq!(sugg, vec!["Sug1".to_string()]);
    }

    #[test]
    fn test_long_prose_is_flushed_before_end() {
        let mut splitter = SuggestionSplitter::new(DEFAULT_SEPARATOR);
        let out = splitter.push("a fairly long sentence that streams through");
        assert!(out.is_some());
        let held = splitter.finish().clean_tail;
        assert_eq!(held.len(), DEFAULT_SEPARATOR.len() - 1);
    }

    #[test]
    fn test_no_separator_keeps_everything() {
        let (clean, sugg) = run(&["Just ", "an answer."]);
        assert_eq!(clean, "Just an answer.");
        assert!(sugg.is_empty());
    }

    #[test]
    fn test_multibyte_prose_flushes_on_char_boundary() {
        let (clean, _) = run(&["héllo wörld ünïcödé ", "ñ and more text"]);
        assert_eq!(clean, "héllo wörld ünïcödé ñ and more text");
    }

    #[test]
    fn test_parse_fenced_block() {
        let raw = "\n```json\n[\"One\", \"Two\", \"Three\", \"Four\"]\n```\n";
        assert_eq!(parse_suggestions(raw).unwrap(), vec!["One", "Two", "Three"]);
    }

    #[test]
    fn test_parse_drops_blank_entries() {
        assert_eq!(parse_suggestions(r#"[" ", "Why?"]"#).unwrap(), vec!["Why?"]);
    }

    #[test]
    fn test_parse_with_trailing_text() {
        let raw = r#"["A"] hope this helps"#;
        assert_eq!(parse_suggestions(raw).unwrap(), vec!["A"]);
    }

    #[test]
    fn test_parse_failure_is_error() {
        assert!(parse_suggestions("not json at all").is_err());
        assert!(parse_suggestions(r#"{"a": 1}"#).is_err());
    }

    #[test]
    fn test_split_complete() {
        let (clean, raw) = split_complete("Answer [1]|||SUGGESTIONS|||[\"x\"]", DEFAULT_SEPARATOR);
        assert_eq!(clean, "Answer [1]");
        assert_eq!(raw, "[\"x\"]");
    }
}
