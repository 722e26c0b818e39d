//! Core data models shared by the retrieval and answering pipeline.
//!
//! Index records come in two kinds: document chunks written by the ingestion
//! pipeline and memory facts distilled from finished turns. Both carry the
//! tenant metadata ([`RecordMetadata`]) needed to enforce [`Scope`] isolation.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The second half of a tenant scope: either a bot or a study space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ScopeTarget {
    Bot(i64),
    StudySpace(i64),
}

/// The `(user_id, bot_id | study_space_id)` tuple restricting what a query sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub user_id: i64,
    pub target: ScopeTarget,
}

impl Scope {
    pub fn bot(user_id: i64, bot_id: i64) -> Self {
        Self {
            user_id,
            target: ScopeTarget::Bot(bot_id),
        }
    }

    pub fn study_space(user_id: i64, study_space_id: i64) -> Self {
        Self {
            user_id,
            target: ScopeTarget::StudySpace(study_space_id),
        }
    }

    pub fn bot_id(&self) -> Option<i64> {
        match self.target {
            ScopeTarget::Bot(id) => Some(id),
            ScopeTarget::StudySpace(_) => None,
        }
    }

    pub fn study_space_id(&self) -> Option<i64> {
        match self.target {
            ScopeTarget::StudySpace(id) => Some(id),
            ScopeTarget::Bot(_) => None,
        }
    }

    /// Returns true when `meta` carries this scope's user and target.
    ///
    /// Records missing `user_id`, or missing both `bot_id` and
    /// `study_space_id`, are never admitted.
    pub fn admits(&self, meta: &RecordMetadata) -> bool {
        if meta.user_id != Some(self.user_id) {
            return false;
        }
        match self.target {
            ScopeTarget::Bot(id) => meta.bot_id == Some(id),
            ScopeTarget::StudySpace(id) => meta.study_space_id == Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            ScopeTarget::Bot(id) => write!(f, "user={} bot={}", self.user_id, id),
            ScopeTarget::StudySpace(id) => write!(f, "user={} space={}", self.user_id, id),
        }
    }
}

/// What an index record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Document,
    Memory,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Document => "document",
            RecordKind::Memory => "memory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(RecordKind::Document),
            "memory" => Some(RecordKind::Memory),
            _ => None,
        }
    }
}

/// Author of a memory fact or chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Filterable metadata stored alongside every index record.
///
/// Tenant fields are optional so that records written by other producers can
/// be represented faithfully; [`Scope::admits`] rejects any that lack them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub kind: RecordKind,
    pub user_id: Option<i64>,
    pub bot_id: Option<i64>,
    pub study_space_id: Option<i64>,
    pub source_id: Option<String>,
    pub source_name: Option<String>,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub role: Option<Role>,
    /// Unix seconds when the record was written.
    pub timestamp: i64,
}

/// One stored unit: a document chunk or a memory fact, with its embedding.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl IndexRecord {
    /// Build a document chunk record for `scope`.
    #[allow(clippy::too_many_arguments)]
    pub fn document_chunk(
        scope: &Scope,
        source_id: &str,
        source_name: &str,
        chunk_index: i64,
        total_chunks: i64,
        text: &str,
        embedding: Vec<f32>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            embedding,
            metadata: RecordMetadata {
                kind: RecordKind::Document,
                user_id: Some(scope.user_id),
                bot_id: scope.bot_id(),
                study_space_id: scope.study_space_id(),
                source_id: Some(source_id.to_string()),
                source_name: Some(source_name.to_string()),
                chunk_index,
                total_chunks,
                role: None,
                timestamp,
            },
        }
    }

    /// Build a memory fact record. Memory is always bot-scoped.
    pub fn memory_fact(
        user_id: i64,
        bot_id: i64,
        role: Role,
        text: &str,
        embedding: Vec<f32>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            embedding,
            metadata: RecordMetadata {
                kind: RecordKind::Memory,
                user_id: Some(user_id),
                bot_id: Some(bot_id),
                study_space_id: None,
                source_id: None,
                source_name: None,
                chunk_index: 0,
                total_chunks: 1,
                role: Some(role),
                timestamp,
            },
        }
    }
}

/// A record returned by a nearest-neighbour query.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub metadata: RecordMetadata,
    /// Cosine distance to the query vector; lower is more similar.
    pub distance: f64,
}

/// Label used as the `source` of memory candidates.
pub const MEMORY_SOURCE: &str = "memory";

/// An ephemeral, ranked retrieval result. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMatch {
    pub content: String,
    /// Human-readable source name (file name, URL title, or `"memory"`).
    pub source: String,
    pub source_id: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    /// Cosine-distance-like score; lower is more similar.
    pub score: f64,
    pub kind: RecordKind,
}

impl CandidateMatch {
    pub fn from_hit(hit: IndexHit) -> Self {
        let kind = hit.metadata.kind;
        let source = match kind {
            RecordKind::Memory => MEMORY_SOURCE.to_string(),
            RecordKind::Document => hit
                .metadata
                .source_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        };
        Self {
            content: hit.text,
            source,
            source_id: hit.metadata.source_id.unwrap_or_else(|| hit.id.clone()),
            chunk_index: hit.metadata.chunk_index,
            total_chunks: hit.metadata.total_chunks,
            score: hit.distance,
            kind,
        }
    }
}

/// A distinct indexed source visible to a scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub source_name: String,
    pub chunk_count: usize,
    /// Unix seconds of the newest chunk for this source.
    pub indexed_at: i64,
}

/// Output of the deterministic evidence gate and the tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceDecision {
    Answer,
    Refuse,
    Uncertain,
}

/// Terminal classification of a turn, driving prompt construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseMode {
    ListSources,
    StrictRefusal,
    StrictAnswerWithContext,
    NonStrictWebOrGeneral,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::ListSources => "LIST_SOURCES",
            ResponseMode::StrictRefusal => "STRICT_REFUSAL",
            ResponseMode::StrictAnswerWithContext => "STRICT_ANSWER_WITH_CONTEXT",
            ResponseMode::NonStrictWebOrGeneral => "NON_STRICT_WEB_OR_GENERAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LIST_SOURCES" => Some(ResponseMode::ListSources),
            "STRICT_REFUSAL" => Some(ResponseMode::StrictRefusal),
            "STRICT_ANSWER_WITH_CONTEXT" => Some(ResponseMode::StrictAnswerWithContext),
            "NON_STRICT_WEB_OR_GENERAL" => Some(ResponseMode::NonStrictWebOrGeneral),
            _ => None,
        }
    }

    /// Modes rendered from templates without consulting the model.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            ResponseMode::ListSources | ResponseMode::StrictRefusal
        )
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
