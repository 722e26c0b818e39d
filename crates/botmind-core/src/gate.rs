//! Deterministic evidence gate.
//!
//! [`evaluate`] maps retrieved candidates to an [`EvidenceDecision`] using
//! only their distance scores, sources, and lengths. It performs no I/O and
//! holds no state, so identical input always yields identical output.
//!
//! All thresholds derive from a single tunable base `threshold`:
//!
//! | Band | Condition | Decision |
//! |------|-----------|----------|
//! | strong | `best <= threshold × 0.92` | ANSWER |
//! | weak | `best >= threshold × 1.08` | REFUSE |
//! | gray | in between | resolved by the rules below |
//!
//! Gray-zone rules, first match wins: two or more distinct sources → ANSWER;
//! top chunk shorter than 200 characters → REFUSE; mean of the top four
//! scores within `threshold` and a best/second gap of at most 0.03 → ANSWER;
//! otherwise REFUSE with [`GateReason::GrayZoneUnresolved`], which the
//! strict boundary may hand to the tie-breaker.

use std::fmt;

use serde::Serialize;

use crate::models::{CandidateMatch, EvidenceDecision};

/// Multiplier giving the ANSWER threshold.
pub const ANSWER_FACTOR: f64 = 0.92;
/// Multiplier giving the REFUSE threshold.
pub const REFUSE_FACTOR: f64 = 1.08;
/// Top chunks shorter than this (in characters) cannot carry a gray-zone answer.
pub const MIN_SUBSTANTIVE_CHARS: usize = 200;
/// Largest best/second-best gap still treated as a consistent cluster.
pub const CLUSTER_MAX_GAP: f64 = 0.03;
/// Number of top scores averaged for the cluster rule.
pub const CLUSTER_SIZE: usize = 4;

/// Why the gate decided what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    NoContext,
    StrongMatch,
    WeakMatch,
    MultiSourceCorroboration,
    TooShort,
    ConsistentCluster,
    GrayZoneUnresolved,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::NoContext => "no_context",
            GateReason::StrongMatch => "strong_match",
            GateReason::WeakMatch => "weak_match",
            GateReason::MultiSourceCorroboration => "multi_source_corroboration",
            GateReason::TooShort => "too_short_to_be_substantive",
            GateReason::ConsistentCluster => "internally_consistent_cluster",
            GateReason::GrayZoneUnresolved => "gray_zone_unresolved",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub decision: EvidenceDecision,
    pub reason: GateReason,
    pub best_score: Option<f64>,
    /// Human-readable reason with the numbers that drove it.
    pub detail: String,
}

impl GateOutcome {
    /// True for the gray-zone default that no deterministic rule resolved.
    pub fn is_unresolved(&self) -> bool {
        self.reason == GateReason::GrayZoneUnresolved
    }
}

/// Evaluate retrieved `candidates` against the base `threshold`.
pub fn evaluate(candidates: &[CandidateMatch], threshold: f64) -> GateOutcome {
    let Some(top) = candidates
        .iter()
        .min_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return GateOutcome {
            decision: EvidenceDecision::Refuse,
            reason: GateReason::NoContext,
            best_score: None,
            detail: GateReason::NoContext.to_string(),
        };
    };

    let mut scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let best = scores[0];
    let take = scores.len().min(CLUSTER_SIZE);
    let avg = scores[..take].iter().sum::<f64>() / take as f64;
    let gap = if scores.len() >= 2 { scores[1] - best } else { 0.0 };
    let mut unique_sources: Vec<&str> = candidates.iter().map(|c| c.source_id.as_str()).collect();
    unique_sources.sort_unstable();
    unique_sources.dedup();

    let t_answer = threshold * ANSWER_FACTOR;
    let t_refuse = threshold * REFUSE_FACTOR;

    let outcome = |decision, reason: GateReason, detail: String| GateOutcome {
        decision,
        reason,
        best_score: Some(best),
        detail: format!("{}: {}", reason, detail),
    };

    if best <= t_answer {
        return outcome(
            EvidenceDecision::Answer,
            GateReason::StrongMatch,
            format!("best={:.3} <= {:.3}", best, t_answer),
        );
    }
    if best >= t_refuse {
        return outcome(
            EvidenceDecision::Refuse,
            GateReason::WeakMatch,
            format!("best={:.3} >= {:.3}", best, t_refuse),
        );
    }
    if unique_sources.len() >= 2 {
        return outcome(
            EvidenceDecision::Answer,
            GateReason::MultiSourceCorroboration,
            format!("{} sources in gray zone", unique_sources.len()),
        );
    }
    let top_len = top.content.chars().count();
    if top_len < MIN_SUBSTANTIVE_CHARS {
        return outcome(
            EvidenceDecision::Refuse,
            GateReason::TooShort,
            format!("top chunk has {} chars", top_len),
        );
    }
    if avg <= threshold && gap <= CLUSTER_MAX_GAP {
        return outcome(
            EvidenceDecision::Answer,
            GateReason::ConsistentCluster,
            format!("avg={:.3} gap={:.3}", avg, gap),
        );
    }
    outcome(
        EvidenceDecision::Refuse,
        GateReason::GrayZoneUnresolved,
        format!("best={:.3} avg={:.3} gap={:.3}", best, avg, gap),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;

    fn cand(source_id: &str, score: f64, len: usize) -> CandidateMatch {
        CandidateMatch {
            content: "x".repeat(len),
            source: format!("{source_id}.pdf"),
            source_id: source_id.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            score,
            kind: RecordKind::Document,
        }
    }

    #[test]
    fn test_no_candidates_refuses() {
        let out = evaluate(&[], 0.45);
        assert_eq!(out.decision, EvidenceDecision::Refuse);
        assert_eq!(out.reason, GateReason::NoContext);
        assert!(out.best_score.is_none());
    }

    #[test]
    fn test_strong_match_for_all_scores_at_or_below_answer_threshold() {
        let threshold = 0.45;
        for i in 0..=41 {
            let best = i as f64 * 0.01;
            if best > threshold * ANSWER_FACTOR {
                continue;
            }
            let out = evaluate(&[cand("a", best, 10), cand("a", 0.9, 10)], threshold);
            assert_eq!(out.decision, EvidenceDecision::Answer, "best={best}");
            assert!(out.detail.contains("strong_match"));
        }
    }

    #[test]
    fn test_weak_match_for_all_scores_at_or_above_refuse_threshold() {
        let threshold = 0.45;
        for i in 49..=120 {
            let best = i as f64 * 0.01;
            if best < threshold * REFUSE_FACTOR {
                continue;
            }
            let out = evaluate(&[cand("a", best, 500), cand("b", best + 0.01, 500)], threshold);
            assert_eq!(out.decision, EvidenceDecision::Refuse, "best={best}");
            assert!(out.detail.contains("weak_match"));
        }
    }

    #[test]
    fn test_gray_zone_multi_source_answers() {
        let out = evaluate(&[cand("a", 0.45, 50), cand("b", 0.46, 50)], 0.45);
        assert_eq!(out.decision, EvidenceDecision::Answer);
        assert_eq!(out.reason, GateReason::MultiSourceCorroboration);
    }

    #[test]
    fn test_gray_zone_short_top_chunk_refuses() {
        let out = evaluate(&[cand("a", 0.45, 199), cand("a", 0.46, 800)], 0.45);
        assert_eq!(out.decision, EvidenceDecision::Refuse);
        assert_eq!(out.reason, GateReason::TooShort);
    }

    #[test]
    fn test_gray_zone_consistent_cluster_answers() {
        let cands = vec![
            cand("a", 0.44, 400),
            cand("a", 0.44, 400),
            cand("a", 0.45, 400),
            cand("a", 0.45, 400),
        ];
        let out = evaluate(&cands, 0.45);
        assert_eq!(out.decision, EvidenceDecision::Answer);
        assert_eq!(out.reason, GateReason::ConsistentCluster);
    }

    #[test]
    fn test_gray_zone_unresolved_defaults_to_refuse() {
        let cands = vec![cand("a", 0.44, 400), cand("a", 0.48, 400)];
        let out = evaluate(&cands, 0.45);
        assert_eq!(out.decision, EvidenceDecision::Refuse);
        assert!(out.is_unresolved());
    }

    #[test]
    fn test_single_candidate_gray_zone_gap_is_zero() {
        let out = evaluate(&[cand("a", 0.44, 400)], 0.45);
        assert_eq!(out.reason, GateReason::ConsistentCluster);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let cands = vec![cand("a", 0.43, 300), cand("a", 0.47, 300), cand("a", 0.5, 300)];
        let first = evaluate(&cands, 0.45);
        let second = evaluate(&cands, 0.45);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unsorted_input_uses_minimum() {
        let out = evaluate(&[cand("a", 0.9, 10), cand("a", 0.1, 10)], 0.45);
        assert_eq!(out.best_score, Some(0.1));
        assert_eq!(out.reason, GateReason::StrongMatch);
    }
}
