//! SQLite-backed [`VectorIndex`].
//!
//! Records live in the `index_records` table. A [`Filter`] is compiled to a
//! parameterized `WHERE` clause, so tenant conditions are applied by SQLite;
//! ranking is cosine distance computed in process over the filtered rows.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use botmind_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use botmind_core::filter::{Filter, FilterValue};
use botmind_core::index::VectorIndex;
use botmind_core::models::{IndexHit, IndexRecord, RecordKind, RecordMetadata, Role};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// A compiled filter: SQL fragment plus its bind values in order.
#[derive(Debug, PartialEq)]
struct WhereClause {
    sql: String,
    params: Vec<FilterValue>,
}

fn compile(filter: &Filter) -> WhereClause {
    let mut params = Vec::new();
    let sql = compile_into(filter, &mut params);
    WhereClause { sql, params }
}

fn compile_into(filter: &Filter, params: &mut Vec<FilterValue>) -> String {
    match filter {
        Filter::Equals(field, value) => {
            params.push(value.clone());
            format!("{} = ?", field.as_str())
        }
        Filter::And(items) if items.is_empty() => "1".to_string(),
        Filter::Or(items) if items.is_empty() => "0".to_string(),
        Filter::And(items) => join(items, " AND ", params),
        Filter::Or(items) => join(items, " OR ", params),
    }
}

fn join(items: &[Filter], op: &str, params: &mut Vec<FilterValue>) -> String {
    let parts: Vec<String> = items.iter().map(|f| compile_into(f, params)).collect();
    format!("({})", parts.join(op))
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [FilterValue],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for p in params {
        query = match p {
            FilterValue::Int(v) => query.bind(*v),
            FilterValue::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

const META_COLUMNS: &str = "id, kind, user_id, bot_id, study_space_id, source_id, source_name, \
     chunk_index, total_chunks, role, created_at";

fn row_metadata(row: &SqliteRow) -> Result<RecordMetadata> {
    let kind: String = row.get("kind");
    let kind = RecordKind::parse(&kind)
        .ok_or_else(|| anyhow::anyhow!("unknown record kind in index: {}", kind))?;
    let role: Option<String> = row.get("role");
    Ok(RecordMetadata {
        kind,
        user_id: row.get("user_id"),
        bot_id: row.get("bot_id"),
        study_space_id: row.get("study_space_id"),
        source_id: row.get("source_id"),
        source_name: row.get("source_name"),
        chunk_index: row.get("chunk_index"),
        total_chunks: row.get("total_chunks"),
        role: role.as_deref().and_then(Role::parse),
        timestamp: row.get("created_at"),
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn add(&self, records: &[IndexRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            let m = &r.metadata;
            sqlx::query(
                "INSERT INTO index_records (id, kind, user_id, bot_id, study_space_id, source_id, \
                 source_name, chunk_index, total_chunks, role, text, embedding, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&r.id)
            .bind(m.kind.as_str())
            .bind(m.user_id)
            .bind(m.bot_id)
            .bind(m.study_space_id)
            .bind(&m.source_id)
            .bind(&m.source_name)
            .bind(m.chunk_index)
            .bind(m.total_chunks)
            .bind(m.role.map(|r| r.as_str()))
            .bind(&r.text)
            .bind(vec_to_blob(&r.embedding))
            .bind(m.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], filter: &Filter, k: usize) -> Result<Vec<IndexHit>> {
        let clause = compile(filter);
        let sql = format!(
            "SELECT {}, text, embedding FROM index_records WHERE {}",
            META_COLUMNS, clause.sql
        );
        let rows = bind_all(sqlx::query(&sql), &clause.params)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            hits.push(IndexHit {
                id: row.get("id"),
                text: row.get("text"),
                metadata: row_metadata(row)?,
                distance: cosine_distance(vector, &embedding),
            });
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, filter: &Filter) -> Result<usize> {
        let clause = compile(filter);
        let sql = format!("DELETE FROM index_records WHERE {}", clause.sql);
        let result = bind_all(sqlx::query(&sql), &clause.params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_all(&self, filter: &Filter) -> Result<Vec<RecordMetadata>> {
        let clause = compile(filter);
        let sql = format!(
            "SELECT {} FROM index_records WHERE {} ORDER BY rowid",
            META_COLUMNS, clause.sql
        );
        let rows = bind_all(sqlx::query(&sql), &clause.params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_metadata).collect()
    }
}
