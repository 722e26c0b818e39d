//! Plain-text ingestion.
//!
//! Splits text into paragraph chunks and writes them through
//! [`KnowledgeIndex::add_document_chunks`], which supersedes any chunks
//! previously indexed for the same source. Parsing other file formats is
//! left to upstream pipelines that produce plain text.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;

use botmind_core::models::Scope;

use crate::chunk::chunk_text;
use crate::knowledge::KnowledgeIndex;

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub source_id: String,
    pub source_name: String,
    pub chunks: usize,
}

/// Chunk `text` and index it as `source_id` in `scope`.
pub async fn index_text(
    knowledge: &KnowledgeIndex,
    scope: &Scope,
    source_id: &str,
    source_name: &str,
    text: &str,
    max_tokens: usize,
) -> Result<IndexReport> {
    let chunks = chunk_text(text, max_tokens);
    if chunks.is_empty() {
        bail!("'{}' has no text to index", source_name);
    }
    let written = knowledge
        .add_document_chunks(scope, source_id, source_name, &chunks)
        .await?;
    Ok(IndexReport {
        source_id: source_id.to_string(),
        source_name: source_name.to_string(),
        chunks: written,
    })
}

/// Index a UTF-8 text file. The source id defaults to the file name, so
/// indexing the same file again replaces its chunks.
pub async fn index_file(
    knowledge: &KnowledgeIndex,
    scope: &Scope,
    path: &Path,
    source_id: Option<&str>,
    max_tokens: usize,
) -> Result<IndexReport> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let id = source_id.unwrap_or(&name).to_string();
    index_text(knowledge, scope, &id, &name, &text, max_tokens).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KeywordEmbedder;
    use botmind_core::index::memory::InMemoryIndex;
    use std::sync::Arc;

    fn knowledge() -> KnowledgeIndex {
        KnowledgeIndex::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(KeywordEmbedder::new()),
        )
    }

    #[tokio::test]
    async fn test_index_file_uses_file_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "First paragraph.\n\nSecond paragraph.").unwrap();

        let k = knowledge();
        let scope = Scope::bot(1, 2);
        let report = index_file(&k, &scope, &path, None, 400).await.unwrap();
        assert_eq!(report.source_id, "notes.txt");
        assert!(report.chunks >= 1);

        let again = index_file(&k, &scope, &path, None, 400).await.unwrap();
        let sources = k.list_sources(&scope).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].chunk_count, again.chunks);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let k = knowledge();
        let err = index_text(&k, &Scope::bot(1, 2), "s", "empty.txt", "  \n\n ", 400)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no text"));
    }
}
