//! Source diversity cap for general retrieval.
//!
//! Selection runs over candidates already ranked by distance:
//!
//! 1. Candidates farther than the similarity cutoff are dropped first, so a
//!    weak match can never take a slot from a strong one.
//! 2. First pass: the best chunk of every distinct source, best source first.
//! 3. Second pass: remaining slots filled in score order, never letting one
//!    source exceed the per-source cap.

use std::collections::HashMap;

use crate::models::CandidateMatch;

/// Default number of chunks any one source may contribute.
pub const DEFAULT_PER_SOURCE_CAP: usize = 2;

/// Select up to `limit` candidates under the diversity cap.
pub fn select_diverse(
    candidates: Vec<CandidateMatch>,
    cutoff: f64,
    limit: usize,
    per_source_cap: usize,
) -> Vec<CandidateMatch> {
    let mut ranked: Vec<CandidateMatch> = candidates
        .into_iter()
        .filter(|c| c.score <= cutoff)
        .collect();
    ranked.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut taken = vec![false; ranked.len()];
    let mut per_source: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<usize> = Vec::new();

    for (i, c) in ranked.iter().enumerate() {
        if order.len() >= limit {
            break;
        }
        if !per_source.contains_key(&c.source_id) && per_source_cap > 0 {
            per_source.insert(c.source_id.clone(), 1);
            taken[i] = true;
            order.push(i);
        }
    }

    for (i, c) in ranked.iter().enumerate() {
        if order.len() >= limit {
            break;
        }
        if taken[i] {
            continue;
        }
        let count = per_source.entry(c.source_id.clone()).or_insert(0);
        if *count < per_source_cap {
            *count += 1;
            taken[i] = true;
            order.push(i);
        }
    }

    let mut slots: Vec<Option<CandidateMatch>> = ranked.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;

    fn cand(source_id: &str, score: f64) -> CandidateMatch {
        CandidateMatch {
            content: format!("{source_id}@{score}"),
            source: format!("{source_id}.txt"),
            source_id: source_id.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            score,
            kind: RecordKind::Document,
        }
    }

    fn count(out: &[CandidateMatch], source: &str) -> usize {
        out.iter().filter(|c| c.source_id == source).count()
    }

    #[test]
    fn test_one_per_source_when_limit_equals_sources() {
        let input = vec![
            cand("a", 0.10),
            cand("a", 0.11),
            cand("a", 0.12),
            cand("b", 0.20),
            cand("b", 0.21),
            cand("c", 0.30),
        ];
        let out = select_diverse(input, 0.60, 3, DEFAULT_PER_SOURCE_CAP);
        assert_eq!(out.len(), 3);
        assert_eq!(count(&out, "a"), 1);
        assert_eq!(count(&out, "b"), 1);
        assert_eq!(count(&out, "c"), 1);
    }

    #[test]
    fn test_dominant_source_capped_at_two() {
        let input = vec![
            cand("big", 0.10),
            cand("big", 0.11),
            cand("big", 0.12),
            cand("big", 0.13),
            cand("big", 0.14),
            cand("small", 0.40),
        ];
        let out = select_diverse(input, 0.60, 4, DEFAULT_PER_SOURCE_CAP);
        assert_eq!(out.len(), 3);
        assert_eq!(count(&out, "big"), 2);
        assert_eq!(count(&out, "small"), 1);
    }

    #[test]
    fn test_best_source_first() {
        let input = vec![cand("b", 0.30), cand("a", 0.10), cand("b", 0.31)];
        let out = select_diverse(input, 0.60, 5, DEFAULT_PER_SOURCE_CAP);
        assert_eq!(out[0].source_id, "a");
        assert_eq!(out[1].source_id, "b");
        assert_eq!(out[2].score, 0.31);
    }

    #[test]
    fn test_cutoff_applied_before_selection() {
        let input = vec![
            cand("weak", 0.70),
            cand("strong", 0.10),
            cand("strong", 0.12),
        ];
        let out = select_diverse(input, 0.60, 2, DEFAULT_PER_SOURCE_CAP);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.source_id == "strong"));
    }

    #[test]
    fn test_everything_beyond_cutoff_is_empty() {
        let out = select_diverse(vec![cand("a", 0.9)], 0.60, 3, DEFAULT_PER_SOURCE_CAP);
        assert!(out.is_empty());
    }
}
