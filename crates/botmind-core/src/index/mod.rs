//! Nearest-neighbour index abstraction.
//!
//! The [`VectorIndex`] trait is the only storage contract the retrieval
//! pipeline depends on. Backends are append-mostly and do not coordinate
//! writers: a record becomes searchable once [`VectorIndex::add`] returns,
//! and callers re-ingesting a source delete its old records first.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`add`](VectorIndex::add) | Append records with their embeddings |
//! | [`query`](VectorIndex::query) | Distance-ranked records matching a filter |
//! | [`delete`](VectorIndex::delete) | Remove every record matching a filter |
//! | [`get_all`](VectorIndex::get_all) | Metadata of every record matching a filter |

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::filter::Filter;
use crate::models::{IndexHit, IndexRecord, RecordKind, RecordMetadata, SourceSummary};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Append records. Existing records are never modified.
    async fn add(&self, records: &[IndexRecord]) -> Result<()>;

    /// Return up to `k` records matching `filter`, nearest first.
    async fn query(&self, vector: &[f32], filter: &Filter, k: usize) -> Result<Vec<IndexHit>>;

    /// Delete every record matching `filter`, returning how many were removed.
    async fn delete(&self, filter: &Filter) -> Result<usize>;

    /// Metadata for every record matching `filter`, in insertion order.
    async fn get_all(&self, filter: &Filter) -> Result<Vec<RecordMetadata>>;
}

/// Collapse chunk metadata into one [`SourceSummary`] per `source_id`,
/// most recently indexed first.
///
/// Memory records and records without a `source_id` are ignored.
pub fn summarize_sources(metas: &[RecordMetadata]) -> Vec<SourceSummary> {
    let mut by_id: HashMap<&str, SourceSummary> = HashMap::new();
    for m in metas {
        if m.kind != RecordKind::Document {
            continue;
        }
        let Some(source_id) = m.source_id.as_deref() else {
            continue;
        };
        let entry = by_id.entry(source_id).or_insert_with(|| SourceSummary {
            source_id: source_id.to_string(),
            source_name: m.source_name.clone().unwrap_or_else(|| source_id.to_string()),
            chunk_count: 0,
            indexed_at: m.timestamp,
        });
        entry.chunk_count += 1;
        entry.indexed_at = entry.indexed_at.max(m.timestamp);
    }

    let mut out: Vec<SourceSummary> = by_id.into_values().collect();
    out.sort_by(|a, b| {
        b.indexed_at
            .cmp(&a.indexed_at)
            .then_with(|| a.source_name.cmp(&b.source_name))
    });
    out
}
