//! Scoped document and memory index.
//!
//! [`KnowledgeIndex`] pairs a [`VectorIndex`] backend with an
//! [`EmbeddingService`] and exposes the tenant-scoped operations the rest
//! of the pipeline uses: writing document chunks and memory facts,
//! deleting a source, listing sources, and nearest-neighbour search.
//!
//! Re-ingesting a source deletes its previous chunks first; the backend
//! does not deduplicate.

use anyhow::{bail, Result};
use std::sync::Arc;

use botmind_core::embedding::EmbeddingTask;
use botmind_core::filter::{Field, Filter};
use botmind_core::index::{summarize_sources, VectorIndex};
use botmind_core::models::{IndexHit, IndexRecord, RecordKind, Role, Scope, SourceSummary};

use crate::embedding::EmbeddingService;
use crate::error::EmbeddingError;

#[derive(Clone)]
pub struct KnowledgeIndex {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingService>,
}

impl KnowledgeIndex {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn EmbeddingService>) -> Self {
        Self { index, embedder }
    }

    /// Replace every chunk of `source_id` in `scope` with `texts`.
    ///
    /// Returns the number of chunks written.
    pub async fn add_document_chunks(
        &self,
        scope: &Scope,
        source_id: &str,
        source_name: &str,
        texts: &[String],
    ) -> Result<usize> {
        let vectors = self
            .embedder
            .embed_batch(texts, EmbeddingTask::RetrievalDocument)
            .await?;
        if vectors.len() != texts.len() {
            bail!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            );
        }

        let removed = self.delete_source(scope, source_id).await?;
        if removed > 0 {
            tracing::debug!(%scope, source_id, removed, "replaced previous chunks");
        }

        let now = chrono::Utc::now().timestamp();
        let total = texts.len() as i64;
        let records: Vec<IndexRecord> = texts
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| {
                IndexRecord::document_chunk(
                    scope,
                    source_id,
                    source_name,
                    i as i64,
                    total,
                    text,
                    vector,
                    now,
                )
            })
            .collect();
        self.index.add(&records).await?;
        tracing::info!(%scope, source_id, source_name, chunks = records.len(), "indexed source");
        Ok(records.len())
    }

    /// Store a durable memory fact. Only bot scopes carry memory.
    pub async fn add_memory(&self, scope: &Scope, text: &str, role: Role) -> Result<()> {
        let Some(bot_id) = scope.bot_id() else {
            bail!("memory is only kept for bot scopes, not {}", scope);
        };
        let vector = self
            .embedder
            .embed(text, EmbeddingTask::RetrievalDocument)
            .await?;
        let record = IndexRecord::memory_fact(
            scope.user_id,
            bot_id,
            role,
            text,
            vector,
            chrono::Utc::now().timestamp(),
        );
        self.index.add(&[record]).await
    }

    pub async fn delete_source(&self, scope: &Scope, source_id: &str) -> Result<usize> {
        let filter = Filter::for_scope_kind(scope, RecordKind::Document)
            .and(Filter::eq(Field::SourceId, source_id));
        self.index.delete(&filter).await
    }

    /// Sources visible to `scope`, most recently indexed first.
    pub async fn list_sources(&self, scope: &Scope) -> Result<Vec<SourceSummary>> {
        let metas = self
            .index
            .get_all(&Filter::for_scope_kind(scope, RecordKind::Document))
            .await?;
        let admitted: Vec<_> = metas.into_iter().filter(|m| scope.admits(m)).collect();
        Ok(summarize_sources(&admitted))
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embedder.embed(text, EmbeddingTask::RetrievalQuery).await
    }

    pub async fn query(&self, vector: &[f32], filter: &Filter, k: usize) -> Result<Vec<IndexHit>> {
        self.index.query(vector, filter, k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KeywordEmbedder;
    use botmind_core::index::memory::InMemoryIndex;

    fn knowledge() -> KnowledgeIndex {
        KnowledgeIndex::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(KeywordEmbedder::default()),
        )
    }

    #[tokio::test]
    async fn test_reingest_replaces_chunks() {
        let k = knowledge();
        let scope = Scope::bot(1, 5);
        k.add_document_chunks(&scope, "s1", "a.txt", &["one".into(), "two".into()])
            .await
            .unwrap();
        k.add_document_chunks(&scope, "s1", "a.txt", &["three".into()])
            .await
            .unwrap();
        let sources = k.list_sources(&scope).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].chunk_count, 1);
    }

    #[tokio::test]
    async fn test_memory_requires_bot_scope() {
        let k = knowledge();
        assert!(k
            .add_memory(&Scope::study_space(1, 2), "fact", Role::User)
            .await
            .is_err());
        k.add_memory(&Scope::bot(1, 5), "fact", Role::User)
            .await
            .unwrap();
        assert!(k.list_sources(&Scope::bot(1, 5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sources_is_scoped() {
        let k = knowledge();
        k.add_document_chunks(&Scope::bot(1, 5), "s1", "mine.txt", &["x".into()])
            .await
            .unwrap();
        k.add_document_chunks(&Scope::bot(2, 5), "s2", "theirs.txt", &["y".into()])
            .await
            .unwrap();
        let mine = k.list_sources(&Scope::bot(1, 5)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].source_name, "mine.txt");
    }
}
