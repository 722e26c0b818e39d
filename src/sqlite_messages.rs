//! SQLite-backed [`MessageStore`].

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use botmind_core::models::{ResponseMode, Role};

use crate::error::PersistError;
use crate::messages::{Attachment, MessageStore, NewMessage, StoredMessage};

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str =
    "id, turn_key, conversation_id, role, content, suggestions_json, sources_json, mode, created_at";

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage, PersistError> {
    let role: String = row.get("role");
    let role = Role::parse(&role)
        .ok_or_else(|| PersistError::Unavailable(format!("unknown role in messages: {}", role)))?;
    let suggestions: String = row.get("suggestions_json");
    let sources: String = row.get("sources_json");
    let mode: Option<String> = row.get("mode");
    Ok(StoredMessage {
        id: row.get("id"),
        turn_key: row.get("turn_key"),
        conversation_id: row.get("conversation_id"),
        role,
        content: row.get("content"),
        suggestions: serde_json::from_str(&suggestions)?,
        sources: serde_json::from_str(&sources)?,
        mode: mode.as_deref().and_then(ResponseMode::parse),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, msg: NewMessage) -> Result<StoredMessage, PersistError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let suggestions = serde_json::to_string(&msg.suggestions)?;
        let sources = serde_json::to_string(&msg.sources)?;

        sqlx::query(
            "INSERT INTO messages (id, turn_key, conversation_id, role, content, \
             suggestions_json, sources_json, mode, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(turn_key) DO NOTHING",
        )
        .bind(&id)
        .bind(&msg.turn_key)
        .bind(&msg.conversation_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(&suggestions)
        .bind(&sources)
        .bind(msg.mode.map(|m| m.as_str()))
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_by_turn_key(&msg.turn_key)
            .await?
            .ok_or_else(|| PersistError::Unavailable(format!("{} vanished after insert", msg.turn_key)))
    }

    async fn get_by_turn_key(
        &self,
        turn_key: &str,
    ) -> Result<Option<StoredMessage>, PersistError> {
        let sql = format!("SELECT {} FROM messages WHERE turn_key = ?", MESSAGE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(turn_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>, PersistError> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistError> {
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY rowid DESC LIMIT ?",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut out = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    async fn add_attachment(
        &self,
        conversation_id: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<(), PersistError> {
        sqlx::query(
            "INSERT INTO attachments (conversation_id, source_id, source_name, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(source_id)
        .bind(source_name)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_attachment(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Attachment>, PersistError> {
        let row = sqlx::query(
            "SELECT conversation_id, source_id, source_name, created_at FROM attachments \
             WHERE conversation_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Attachment {
            conversation_id: r.get("conversation_id"),
            source_id: r.get("source_id"),
            source_name: r.get("source_name"),
            created_at: r.get("created_at"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SourceRef;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteMessageStore) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("msg.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (tmp, SqliteMessageStore::new(pool))
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let (_tmp, store) = setup().await;
        let saved = store
            .save(NewMessage {
                turn_key: "turn-1:assistant".into(),
                conversation_id: "c1".into(),
                role: Role::Assistant,
                content: "Paris [1]".into(),
                suggestions: vec!["Why?".into(), "When?".into()],
                sources: vec![SourceRef {
                    index: 1,
                    source: "geo.txt".into(),
                    source_id: "s1".into(),
                    chunk_index: 0,
                }],
                mode: Some(ResponseMode::StrictAnswerWithContext),
            })
            .await
            .unwrap();

        let loaded = store.get(&saved.id).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.suggestions, vec!["Why?", "When?"]);
        assert_eq!(loaded.mode, Some(ResponseMode::StrictAnswerWithContext));
    }

    #[tokio::test]
    async fn test_duplicate_turn_key_not_inserted() {
        let (_tmp, store) = setup().await;
        let make = |content: &str| NewMessage {
            turn_key: "turn-1:assistant".into(),
            conversation_id: "c1".into(),
            role: Role::Assistant,
            content: content.into(),
            suggestions: vec![],
            sources: vec![],
            mode: None,
        };
        let a = store.save(make("one")).await.unwrap();
        let b = store.save(make("two")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.recent("c1", 10).await.unwrap().len(), 1);
        let found = store.get_by_turn_key("turn-1:assistant").await.unwrap().unwrap();
        assert_eq!(found.content, "one");
    }

    #[tokio::test]
    async fn test_latest_attachment_and_missing_message() {
        let (_tmp, store) = setup().await;
        store.add_attachment("c1", "s1", "a.pdf").await.unwrap();
        store.add_attachment("c1", "s2", "b.pdf").await.unwrap();
        let latest = store.latest_attachment("c1").await.unwrap().unwrap();
        assert_eq!(latest.source_name, "b.pdf");
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
