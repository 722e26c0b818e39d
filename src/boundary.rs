//! Per-turn response mode decision.
//!
//! ```text
//! strict? ── no ──▶ NON_STRICT_WEB_OR_GENERAL
//!    │
//!   yes
//!    ├── source-listing question ──▶ LIST_SOURCES
//!    └── retrieve ─▶ gate
//!                     ├── ANSWER ──▶ STRICT_ANSWER_WITH_CONTEXT
//!                     ├── REFUSE ──▶ STRICT_REFUSAL
//!                     └── unresolved gray zone ─▶ tie-breaker ─▶ one of the above
//! ```
//!
//! Nothing carries over between turns. Only document candidates are gated;
//! memory candidates are passed along for context.

use botmind_core::gate::{evaluate, GateOutcome};
use botmind_core::intent::is_source_listing_question;
use botmind_core::models::{EvidenceDecision, ResponseMode, Scope, SourceSummary};

use crate::retriever::{Retrieval, Retriever};
use crate::tiebreaker::EvidenceTiebreaker;

/// Outcome of [`StrictBoundary::decide_response_mode`].
#[derive(Debug, Clone)]
pub struct BoundaryDecision {
    pub mode: ResponseMode,
    /// Retrieved evidence. `None` when no retrieval ran for the decision.
    pub retrieval: Option<Retrieval>,
    pub best_score: Option<f64>,
    pub reason: String,
    /// Sources for LIST_SOURCES; empty otherwise.
    pub listed_sources: Vec<SourceSummary>,
    /// Whether generation may use the backend's web search.
    pub web_search: bool,
}

impl BoundaryDecision {
    fn new(mode: ResponseMode, reason: impl Into<String>) -> Self {
        Self {
            mode,
            retrieval: None,
            best_score: None,
            reason: reason.into(),
            listed_sources: Vec::new(),
            web_search: false,
        }
    }
}

pub struct StrictBoundary {
    retriever: Retriever,
    tiebreaker: EvidenceTiebreaker,
    threshold: f64,
}

impl StrictBoundary {
    pub fn new(retriever: Retriever, tiebreaker: EvidenceTiebreaker, threshold: f64) -> Self {
        Self {
            retriever,
            tiebreaker,
            threshold,
        }
    }

    pub async fn decide_response_mode(
        &self,
        question: &str,
        strict: bool,
        web_search_allowed: bool,
        scope: &Scope,
        conversation_id: Option<&str>,
    ) -> BoundaryDecision {
        if !strict {
            let mut decision =
                BoundaryDecision::new(ResponseMode::NonStrictWebOrGeneral, "non_strict");
            decision.web_search = web_search_allowed;
            return decision;
        }

        if is_source_listing_question(question) {
            let sources = self
                .retriever
                .knowledge()
                .list_sources(scope)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(%scope, error = %e, "listing sources failed");
                    Vec::new()
                });
            let mut decision = BoundaryDecision::new(ResponseMode::ListSources, "source_listing");
            decision.listed_sources = sources;
            return decision;
        }

        let retrieval = self
            .retriever
            .retrieve(question, scope, conversation_id)
            .await;
        let outcome = evaluate(&retrieval.documents, self.threshold);
        let (mode, reason) = self.resolve(question, &retrieval, &outcome).await;

        tracing::debug!(
            %scope,
            mode = %mode,
            reason = %reason,
            best = ?outcome.best_score,
            documents = retrieval.documents.len(),
            memories = retrieval.memories.len(),
            "response mode decided"
        );

        BoundaryDecision {
            mode,
            best_score: outcome.best_score,
            reason,
            retrieval: Some(retrieval),
            listed_sources: Vec::new(),
            web_search: false,
        }
    }

    async fn resolve(
        &self,
        question: &str,
        retrieval: &Retrieval,
        outcome: &GateOutcome,
    ) -> (ResponseMode, String) {
        match outcome.decision {
            EvidenceDecision::Answer => {
                (ResponseMode::StrictAnswerWithContext, outcome.detail.clone())
            }
            EvidenceDecision::Refuse | EvidenceDecision::Uncertain
                if outcome.is_unresolved() && self.tiebreaker.is_enabled() =>
            {
                let verdict = self
                    .tiebreaker
                    .arbitrate(question, &retrieval.documents)
                    .await;
                let mode = if verdict.decision == EvidenceDecision::Answer {
                    ResponseMode::StrictAnswerWithContext
                } else {
                    ResponseMode::StrictRefusal
                };
                (
                    mode,
                    format!(
                        "{}; tiebreaker: {} ({:.2})",
                        outcome.detail, verdict.reason, verdict.confidence
                    ),
                )
            }
            EvidenceDecision::Refuse | EvidenceDecision::Uncertain => {
                (ResponseMode::StrictRefusal, outcome.detail.clone())
            }
        }
    }
}
