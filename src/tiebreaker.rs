//! Model-backed arbiter for gray-zone evidence.
//!
//! Only consulted when the deterministic gate leaves a gray-zone case
//! unresolved. The model sees the truncated question and the two best
//! candidates with their distance scores, and must answer with a JSON
//! verdict `{decision, confidence, reason}`.
//!
//! [`EvidenceTiebreaker::arbitrate`] never fails: transport errors, timeouts
//! and unparseable verdicts all become REFUSE (`tiebreaker_error`), and an
//! ANSWER below the confidence floor is downgraded to REFUSE.

use serde::Deserialize;
use std::sync::Arc;

use botmind_core::embedding::truncate_chars;
use botmind_core::models::{CandidateMatch, EvidenceDecision};

use crate::config::TiebreakerConfig;
use crate::error::ArbitrationError;
use crate::generation::{ChatTurn, GenerationParams, GenerationService};

const TOP_CANDIDATES: usize = 2;

const SYSTEM_INSTRUCTION: &str = "You judge whether retrieved excerpts are sufficient to answer a \
question. Use only the excerpts shown. Do not add facts, do not answer the question, and do not \
guess. Lower scores mean closer matches. Reply with JSON only: \
{\"decision\": \"ANSWER\" | \"REFUSE\", \"confidence\": number between 0 and 1, \"reason\": short string}.";

/// Final tie-breaker judgement. `decision` is never UNCERTAIN.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: EvidenceDecision,
    pub confidence: f64,
    pub reason: String,
}

impl Verdict {
    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            decision: EvidenceDecision::Refuse,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    decision: String,
    confidence: f64,
    #[serde(default)]
    reason: String,
}

pub struct EvidenceTiebreaker {
    generator: Arc<dyn GenerationService>,
    config: TiebreakerConfig,
}

impl EvidenceTiebreaker {
    pub fn new(generator: Arc<dyn GenerationService>, config: TiebreakerConfig) -> Self {
        Self { generator, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Decide ANSWER or REFUSE for a gray-zone case.
    pub async fn arbitrate(&self, question: &str, candidates: &[CandidateMatch]) -> Verdict {
        match self.try_arbitrate(question, candidates).await {
            Ok(v) if v.decision == EvidenceDecision::Answer
                && v.confidence < self.config.min_confidence =>
            {
                tracing::debug!(
                    confidence = v.confidence,
                    floor = self.config.min_confidence,
                    "tie-breaker answer below confidence floor"
                );
                Verdict {
                    decision: EvidenceDecision::Refuse,
                    confidence: v.confidence,
                    reason: format!("low_confidence: {}", v.reason),
                }
            }
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "tie-breaker failed");
                Verdict::refuse("tiebreaker_error")
            }
        }
    }

    async fn try_arbitrate(
        &self,
        question: &str,
        candidates: &[CandidateMatch],
    ) -> Result<Verdict, ArbitrationError> {
        let prompt = self.build_prompt(question, candidates);
        let params = GenerationParams {
            temperature: 0.0,
            max_tokens: 200,
            web_search: false,
            response_schema: Some(verdict_schema()),
        };
        let raw = self
            .generator
            .generate(SYSTEM_INSTRUCTION, &[ChatTurn::user(prompt)], &params)
            .await?;
        parse_verdict(&raw)
    }

    fn build_prompt(&self, question: &str, candidates: &[CandidateMatch]) -> String {
        let mut ranked: Vec<&CandidateMatch> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut prompt = format!(
            "Question: {}\n\n",
            truncate_chars(question, self.config.question_chars)
        );
        for (i, c) in ranked.iter().take(TOP_CANDIDATES).enumerate() {
            prompt.push_str(&format!(
                "Excerpt {} (source: {}, score: {:.3}):\n{}\n\n",
                i + 1,
                c.source,
                c.score,
                truncate_chars(&c.content, self.config.content_chars)
            ));
        }
        prompt.push_str("Are these excerpts sufficient to answer the question?");
        prompt
    }
}

fn verdict_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "decision": {"type": "string", "enum": ["ANSWER", "REFUSE"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "reason": {"type": "string"}
        },
        "required": ["decision", "confidence", "reason"],
        "additionalProperties": false
    })
}

fn parse_verdict(raw: &str) -> Result<Verdict, ArbitrationError> {
    let trimmed = raw.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(ArbitrationError::Parse(preview(trimmed))),
    };
    let parsed: RawVerdict =
        serde_json::from_str(body).map_err(|e| ArbitrationError::Parse(e.to_string()))?;

    let decision = match parsed.decision.trim().to_ascii_uppercase().as_str() {
        "ANSWER" => EvidenceDecision::Answer,
        "REFUSE" => EvidenceDecision::Refuse,
        other => {
            return Err(ArbitrationError::Parse(format!(
                "unknown decision {:?}",
                other
            )))
        }
    };
    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(ArbitrationError::Parse(format!(
            "confidence {} outside [0, 1]",
            parsed.confidence
        )));
    }

    Ok(Verdict {
        decision,
        confidence: parsed.confidence,
        reason: parsed.reason,
    })
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedGenerator};
    use botmind_core::models::RecordKind;

    fn cand(source_id: &str, score: f64, content: &str) -> CandidateMatch {
        CandidateMatch {
            content: content.into(),
            source: format!("{}.txt", source_id),
            source_id: source_id.into(),
            chunk_index: 0,
            total_chunks: 1,
            score,
            kind: RecordKind::Document,
        }
    }

    fn breaker(reply: Reply) -> (Arc<ScriptedGenerator>, EvidenceTiebreaker) {
        let gen = Arc::new(ScriptedGenerator::new(vec![reply]));
        let tb = EvidenceTiebreaker::new(gen.clone(), TiebreakerConfig::default());
        (gen, tb)
    }

    #[tokio::test]
    async fn test_confident_answer_accepted() {
        let (_, tb) = breaker(Reply::text(
            r#"{"decision":"ANSWER","confidence":0.9,"reason":"direct"}"#,
        ));
        let v = tb.arbitrate("q", &[cand("a", 0.43, "x")]).await;
        assert_eq!(v.decision, EvidenceDecision::Answer);
    }

    #[tokio::test]
    async fn test_low_confidence_answer_downgraded() {
        let (_, tb) = breaker(Reply::text(
            r#"{"decision":"ANSWER","confidence":0.5,"reason":"maybe"}"#,
        ));
        let v = tb.arbitrate("q", &[cand("a", 0.43, "x")]).await;
        assert_eq!(v.decision, EvidenceDecision::Refuse);
        assert!(v.reason.starts_with("low_confidence"));
    }

    #[tokio::test]
    async fn test_failure_and_garbage_refuse() {
        let (_, tb) = breaker(Reply::Fail);
        let v = tb.arbitrate("q", &[cand("a", 0.43, "x")]).await;
        assert_eq!(v.decision, EvidenceDecision::Refuse);
        assert_eq!(v.reason, "tiebreaker_error");

        let (_, tb) = breaker(Reply::text("I think you should answer"));
        let v = tb.arbitrate("q", &[cand("a", 0.43, "x")]).await;
        assert_eq!(v.reason, "tiebreaker_error");
    }

    #[tokio::test]
    async fn test_prompt_truncates_and_includes_top_two_scores() {
        let (gen, tb) = breaker(Reply::text(
            r#"{"decision":"REFUSE","confidence":0.8,"reason":"off topic"}"#,
        ));
        let question = "q".repeat(400);
        let long = "c".repeat(1000);
        tb.arbitrate(
            &question,
            &[
                cand("third", 0.48, "third"),
                cand("best", 0.42, &long),
                cand("second", 0.44, "second"),
            ],
        )
        .await;

        let calls = gen.calls();
        assert_eq!(calls.len(), 1);
        let prompt = &calls[0].contents[0].content;
        assert!(prompt.contains(&"q".repeat(250)));
        assert!(!prompt.contains(&"q".repeat(251)));
        assert!(prompt.contains(&"c".repeat(350)));
        assert!(!prompt.contains(&"c".repeat(351)));
        assert!(prompt.contains("score: 0.420"));
        assert!(prompt.contains("score: 0.440"));
        assert!(!prompt.contains("third"));
        assert!(calls[0].params.response_schema.is_some());
    }

    #[test]
    fn test_parse_verdict_fenced() {
        let v = parse_verdict("```json\n{\"decision\":\"refuse\",\"confidence\":0.7,\"reason\":\"r\"}\n```")
            .unwrap();
        assert_eq!(v.decision, EvidenceDecision::Refuse);
    }

    #[test]
    fn test_parse_verdict_rejects_out_of_range_confidence() {
        assert!(parse_verdict(r#"{"decision":"ANSWER","confidence":1.5}"#).is_err());
    }
}
