//! In-memory [`VectorIndex`] for tests and embedded use.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Queries are
//! brute-force cosine distance over every record that passes the filter.

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::filter::Filter;
use crate::models::{IndexHit, IndexRecord, RecordMetadata};

use super::VectorIndex;

/// Brute-force index held entirely in process memory.
pub struct InMemoryIndex {
    records: RwLock<Vec<IndexRecord>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn add(&self, records: &[IndexRecord]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        stored.extend(records.iter().cloned());
        Ok(())
    }

    async fn query(&self, vector: &[f32], filter: &Filter, k: usize) -> Result<Vec<IndexHit>> {
        let stored = self.records.read().map_err(poisoned)?;
        let mut hits: Vec<IndexHit> = stored
            .iter()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| IndexHit {
                id: r.id.clone(),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
                distance: cosine_distance(vector, &r.embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, filter: &Filter) -> Result<usize> {
        let mut stored = self.records.write().map_err(poisoned)?;
        let before = stored.len();
        stored.retain(|r| !filter.matches(&r.metadata));
        Ok(before - stored.len())
    }

    async fn get_all(&self, filter: &Filter) -> Result<Vec<RecordMetadata>> {
        let stored = self.records.read().map_err(poisoned)?;
        Ok(stored
            .iter()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| r.metadata.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Field;
    use crate::models::{RecordKind, Scope};

    fn chunk(scope: &Scope, source: &str, idx: i64, v: Vec<f32>) -> IndexRecord {
        IndexRecord::document_chunk(scope, source, &format!("{source}.txt"), idx, 3, "text", v, 100)
    }

    #[tokio::test]
    async fn test_query_ranks_by_distance() {
        let index = InMemoryIndex::new();
        let scope = Scope::bot(1, 5);
        index
            .add(&[
                chunk(&scope, "a", 0, vec![0.0, 1.0]),
                chunk(&scope, "b", 0, vec![1.0, 0.0]),
                chunk(&scope, "c", 0, vec![0.8, 0.6]),
            ])
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], &Filter::for_scope(&scope), 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.source_id.as_deref(), Some("b"));
        assert_eq!(hits[1].metadata.source_id.as_deref(), Some("c"));
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_query_respects_tenant_filter() {
        let index = InMemoryIndex::new();
        let mine = Scope::bot(1, 5);
        let theirs = Scope::bot(2, 5);
        index
            .add(&[
                chunk(&mine, "a", 0, vec![0.5, 0.5]),
                chunk(&theirs, "b", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], &Filter::for_scope(&mine), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.user_id, Some(1));
    }

    #[tokio::test]
    async fn test_delete_by_source() {
        let index = InMemoryIndex::new();
        let scope = Scope::bot(1, 5);
        index
            .add(&[
                chunk(&scope, "a", 0, vec![1.0]),
                chunk(&scope, "a", 1, vec![1.0]),
                chunk(&scope, "b", 0, vec![1.0]),
            ])
            .await
            .unwrap();

        let removed = index
            .delete(&Filter::for_scope(&scope).and(Filter::eq(Field::SourceId, "a")))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_get_all_by_kind() {
        let index = InMemoryIndex::new();
        let scope = Scope::bot(1, 5);
        index
            .add(&[
                chunk(&scope, "a", 0, vec![1.0]),
                IndexRecord::memory_fact(1, 5, crate::models::Role::User, "fact", vec![1.0], 5),
            ])
            .await
            .unwrap();
        let docs = index
            .get_all(&Filter::for_scope_kind(&scope, RecordKind::Document))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].kind, RecordKind::Document);
    }
}
