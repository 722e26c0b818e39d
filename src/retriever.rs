//! Retrieval strategies over the scoped knowledge index.
//!
//! [`Retriever::retrieve`] classifies the question, embeds it once, runs the
//! matching document strategy and then an unconditional memory search:
//!
//! | Strategy | Behaviour |
//! |----------|-----------|
//! | specific | top-`limit` chunks of the named source |
//! | reference | latest conversation attachment, else newest source, then as specific |
//! | comparative | up to N most relevant sources, `max(2, limit / n)` chunks each, concatenated |
//! | general | one scope-wide query, cutoff then diversity cap |
//!
//! Memory candidates are appended after document candidates, never merged.
//!
//! Every failure (embedding, index, attachment lookup) degrades to fewer or
//! no candidates. Hits lacking the caller's tenant metadata are dropped and
//! logged as data-integrity problems.

use std::collections::HashMap;
use std::sync::Arc;

use botmind_core::classifier::{classify, QueryType};
use botmind_core::diversity::{select_diverse, DEFAULT_PER_SOURCE_CAP};
use botmind_core::filter::{Field, Filter};
use botmind_core::models::{CandidateMatch, IndexHit, RecordKind, Scope, SourceSummary};

use crate::config::RetrievalConfig;
use crate::knowledge::KnowledgeIndex;
use crate::messages::MessageStore;

/// Width of the general-search pool relative to `limit`, before cutoff and
/// diversity selection.
const GENERAL_POOL_FACTOR: usize = 4;
/// Chunks inspected by the comparative relevance probe.
const PROBE_K: usize = 50;

/// Candidates gathered for one question.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub query_type: Option<QueryType>,
    pub documents: Vec<CandidateMatch>,
    pub memories: Vec<CandidateMatch>,
}

impl Retrieval {
    /// Document candidates followed by memory candidates.
    pub fn all(&self) -> Vec<CandidateMatch> {
        self.documents
            .iter()
            .chain(self.memories.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.memories.is_empty()
    }
}

#[derive(Clone)]
pub struct Retriever {
    knowledge: KnowledgeIndex,
    messages: Arc<dyn MessageStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        knowledge: KnowledgeIndex,
        messages: Arc<dyn MessageStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            knowledge,
            messages,
            config,
        }
    }

    pub fn knowledge(&self) -> &KnowledgeIndex {
        &self.knowledge
    }

    /// Classify `question`, run its strategy, then search memory.
    pub async fn retrieve(
        &self,
        question: &str,
        scope: &Scope,
        conversation_id: Option<&str>,
    ) -> Retrieval {
        let sources = self.sources(scope).await;
        let names: Vec<String> = sources.iter().map(|s| s.source_name.clone()).collect();
        let classification = classify(question, &names);
        tracing::debug!(
            %scope,
            query_type = ?classification.query_type,
            source = ?classification.source_name,
            "classified question"
        );

        let Some(vector) = self.embed(question).await else {
            return Retrieval {
                query_type: Some(classification.query_type),
                ..Default::default()
            };
        };

        let limit = self.config.limit;
        let documents = match classification.query_type {
            QueryType::Specific => match classification.source_name.as_deref() {
                Some(name) => self.specific(&vector, scope, &sources, name, limit).await,
                None => Vec::new(),
            },
            QueryType::Reference => {
                self.reference(&vector, scope, &sources, conversation_id, limit)
                    .await
            }
            QueryType::Comparative => self.comparative(&vector, scope, &sources, limit).await,
            QueryType::General => self.general(&vector, scope, limit).await,
        };
        let memories = self.memory(&vector, scope).await;

        Retrieval {
            query_type: Some(classification.query_type),
            documents,
            memories,
        }
    }

    /// Top chunks of the source named `source_name`.
    pub async fn search_specific(
        &self,
        query: &str,
        scope: &Scope,
        source_name: &str,
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let Some(vector) = self.embed(query).await else {
            return Vec::new();
        };
        let sources = self.sources(scope).await;
        self.specific(&vector, scope, &sources, source_name, limit)
            .await
    }

    /// Chunks of the implicitly referenced source.
    pub async fn search_reference(
        &self,
        query: &str,
        scope: &Scope,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let Some(vector) = self.embed(query).await else {
            return Vec::new();
        };
        let sources = self.sources(scope).await;
        self.reference(&vector, scope, &sources, conversation_id, limit)
            .await
    }

    /// Chunks from several sources, per-source results concatenated.
    pub async fn search_comparative(
        &self,
        query: &str,
        scope: &Scope,
        sources: &[SourceSummary],
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let Some(vector) = self.embed(query).await else {
            return Vec::new();
        };
        self.comparative(&vector, scope, sources, limit).await
    }

    /// Scope-wide search under the similarity cutoff and diversity cap.
    pub async fn search_general(
        &self,
        query: &str,
        scope: &Scope,
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let Some(vector) = self.embed(query).await else {
            return Vec::new();
        };
        self.general(&vector, scope, limit).await
    }

    /// Memory facts for bot scopes; always empty for study spaces.
    pub async fn search_memory(&self, query: &str, scope: &Scope) -> Vec<CandidateMatch> {
        let Some(vector) = self.embed(query).await else {
            return Vec::new();
        };
        self.memory(&vector, scope).await
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.knowledge.embed_query(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; continuing without evidence");
                None
            }
        }
    }

    async fn sources(&self, scope: &Scope) -> Vec<SourceSummary> {
        self.knowledge
            .list_sources(scope)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(%scope, error = %e, "listing sources failed");
                Vec::new()
            })
    }

    async fn specific(
        &self,
        vector: &[f32],
        scope: &Scope,
        sources: &[SourceSummary],
        source_name: &str,
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let ids: Vec<Filter> = sources
            .iter()
            .filter(|s| s.source_name.eq_ignore_ascii_case(source_name))
            .map(|s| Filter::eq(Field::SourceId, s.source_id.as_str()))
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }
        let filter = Filter::for_scope_kind(scope, RecordKind::Document).and(Filter::any(ids));
        self.query(vector, scope, &filter, limit).await
    }

    async fn reference(
        &self,
        vector: &[f32],
        scope: &Scope,
        sources: &[SourceSummary],
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let attached = match conversation_id {
            Some(conv) => match self.messages.latest_attachment(conv).await {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(conversation = conv, error = %e, "attachment lookup failed");
                    None
                }
            },
            None => None,
        };

        let target = attached
            .as_ref()
            .and_then(|a| sources.iter().find(|s| s.source_id == a.source_id))
            .or_else(|| sources.first());
        let Some(target) = target else {
            tracing::debug!(%scope, "no source to resolve reference against");
            return Vec::new();
        };
        let filter = Filter::for_scope_kind(scope, RecordKind::Document)
            .and(Filter::eq(Field::SourceId, target.source_id.as_str()));
        self.query(vector, scope, &filter, limit).await
    }

    async fn comparative(
        &self,
        vector: &[f32],
        scope: &Scope,
        sources: &[SourceSummary],
        limit: usize,
    ) -> Vec<CandidateMatch> {
        let chosen = self.rank_sources(vector, scope, sources).await;
        if chosen.is_empty() {
            return Vec::new();
        }
        let per_source_limit = (limit / chosen.len()).max(2);

        let mut out = Vec::new();
        for source_id in &chosen {
            let filter = Filter::for_scope_kind(scope, RecordKind::Document)
                .and(Filter::eq(Field::SourceId, source_id.as_str()));
            out.extend(self.query(vector, scope, &filter, per_source_limit).await);
        }
        out.truncate(limit);
        out
    }

    /// Source ids ordered by their best probe distance, then by recency,
    /// capped at `max_comparative_sources`.
    async fn rank_sources(
        &self,
        vector: &[f32],
        scope: &Scope,
        sources: &[SourceSummary],
    ) -> Vec<String> {
        let probe = self
            .query(
                vector,
                scope,
                &Filter::for_scope_kind(scope, RecordKind::Document),
                PROBE_K,
            )
            .await;
        let mut best: HashMap<&str, f64> = HashMap::new();
        for c in &probe {
            let entry = best.entry(c.source_id.as_str()).or_insert(c.score);
            *entry = entry.min(c.score);
        }

        let mut ranked: Vec<(usize, &SourceSummary)> = sources.iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            match (best.get(a.source_id.as_str()), best.get(b.source_id.as_str())) {
                (Some(x), Some(y)) => x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => ia.cmp(ib),
            }
        });
        ranked
            .into_iter()
            .take(self.config.max_comparative_sources)
            .map(|(_, s)| s.source_id.clone())
            .collect()
    }

    async fn general(&self, vector: &[f32], scope: &Scope, limit: usize) -> Vec<CandidateMatch> {
        let filter = Filter::for_scope_kind(scope, RecordKind::Document);
        let pool = self
            .query(vector, scope, &filter, limit * GENERAL_POOL_FACTOR)
            .await;
        select_diverse(
            pool,
            self.config.similarity_cutoff,
            limit,
            DEFAULT_PER_SOURCE_CAP,
        )
    }

    async fn memory(&self, vector: &[f32], scope: &Scope) -> Vec<CandidateMatch> {
        if scope.bot_id().is_none() || self.config.memory_limit == 0 {
            return Vec::new();
        }
        let filter = Filter::for_scope_kind(scope, RecordKind::Memory);
        self.query(vector, scope, &filter, self.config.memory_limit)
            .await
    }

    async fn query(
        &self,
        vector: &[f32],
        scope: &Scope,
        filter: &Filter,
        k: usize,
    ) -> Vec<CandidateMatch> {
        match self.knowledge.query(vector, filter, k).await {
            Ok(hits) => admit(scope, hits),
            Err(e) => {
                tracing::warn!(%scope, error = %e, "index query failed");
                Vec::new()
            }
        }
    }
}

/// Keep only hits that carry `scope`'s tenant metadata.
fn admit(scope: &Scope, hits: Vec<IndexHit>) -> Vec<CandidateMatch> {
    hits.into_iter()
        .filter_map(|hit| {
            if scope.admits(&hit.metadata) {
                Some(CandidateMatch::from_hit(hit))
            } else {
                tracing::warn!(%scope, record = %hit.id, "dropping record outside caller scope");
                None
            }
        })
        .collect()
}
