//! Conversation message and attachment storage.
//!
//! [`MessageStore`] is the single durability boundary of a turn. Every
//! message is written with a `turn_key`; a second write with the same key
//! returns the already-stored message instead of inserting a duplicate, so
//! a retried turn persists at most once.
//!
//! Implementations: [`InMemoryMessageStore`] here and
//! [`SqliteMessageStore`](crate::sqlite_messages::SqliteMessageStore).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use botmind_core::models::{CandidateMatch, ResponseMode, Role};

use crate::error::PersistError;

/// A numbered source attached to an assistant message, matching the `[n]`
/// markers the answer may cite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub index: usize,
    pub source: String,
    pub source_id: String,
    pub chunk_index: i64,
}

impl SourceRef {
    /// Number `candidates` from 1 in order.
    pub fn numbered(candidates: &[CandidateMatch]) -> Vec<SourceRef> {
        candidates
            .iter()
            .enumerate()
            .map(|(i, c)| SourceRef {
                index: i + 1,
                source: c.source.clone(),
                source_id: c.source_id.clone(),
                chunk_index: c.chunk_index,
            })
            .collect()
    }
}

/// A message to be written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Idempotency key; unique per turn and role.
    pub turn_key: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub suggestions: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub mode: Option<ResponseMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub turn_key: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub suggestions: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub mode: Option<ResponseMode>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub conversation_id: String,
    pub source_id: String,
    pub source_name: String,
    pub created_at: i64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert `msg` unless a message with the same `turn_key` exists;
    /// either way return the stored message.
    async fn save(&self, msg: NewMessage) -> Result<StoredMessage, PersistError>;

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>, PersistError>;

    /// The message written under `turn_key`, if any.
    async fn get_by_turn_key(
        &self,
        turn_key: &str,
    ) -> Result<Option<StoredMessage>, PersistError>;

    /// The last `limit` messages of a conversation, oldest first.
    async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistError>;

    async fn add_attachment(
        &self,
        conversation_id: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<(), PersistError>;

    /// The most recently attached file of a conversation.
    async fn latest_attachment(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Attachment>, PersistError>;
}

#[derive(Default)]
struct MemoryState {
    messages: Vec<StoredMessage>,
    by_turn: HashMap<String, usize>,
    attachments: Vec<Attachment>,
}

/// Process-local message store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryMessageStore {
    state: Mutex<MemoryState>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, PersistError> {
        self.state
            .lock()
            .map_err(|_| PersistError::Unavailable("message store lock poisoned".into()))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(&self, msg: NewMessage) -> Result<StoredMessage, PersistError> {
        let mut state = self.lock()?;
        if let Some(&pos) = state.by_turn.get(&msg.turn_key) {
            return Ok(state.messages[pos].clone());
        }
        let stored = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            turn_key: msg.turn_key.clone(),
            conversation_id: msg.conversation_id,
            role: msg.role,
            content: msg.content,
            suggestions: msg.suggestions,
            sources: msg.sources,
            mode: msg.mode,
            created_at: chrono::Utc::now().timestamp(),
        };
        let pos = state.messages.len();
        state.messages.push(stored.clone());
        state.by_turn.insert(msg.turn_key, pos);
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>, PersistError> {
        let state = self.lock()?;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn get_by_turn_key(
        &self,
        turn_key: &str,
    ) -> Result<Option<StoredMessage>, PersistError> {
        let state = self.lock()?;
        Ok(state
            .by_turn
            .get(turn_key)
            .map(|&pos| state.messages[pos].clone()))
    }

    async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistError> {
        let state = self.lock()?;
        let mut out: Vec<StoredMessage> = state
            .messages
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn add_attachment(
        &self,
        conversation_id: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<(), PersistError> {
        let mut state = self.lock()?;
        state.attachments.push(Attachment {
            conversation_id: conversation_id.to_string(),
            source_id: source_id.to_string(),
            source_name: source_name.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }

    async fn latest_attachment(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Attachment>, PersistError> {
        let state = self.lock()?;
        Ok(state
            .attachments
            .iter()
            .rev()
            .find(|a| a.conversation_id == conversation_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(turn: &str, conv: &str, content: &str) -> NewMessage {
        NewMessage {
            turn_key: turn.into(),
            conversation_id: conv.into(),
            role: Role::Assistant,
            content: content.into(),
            suggestions: vec!["next?".into()],
            sources: vec![],
            mode: Some(ResponseMode::StrictRefusal),
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_turn_key() {
        let store = InMemoryMessageStore::new();
        let a = store.save(msg("t1", "c1", "first")).await.unwrap();
        let b = store.save(msg("t1", "c1", "second")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.content, "first");
        assert_eq!(store.len(), 1);

        let found = store.get_by_turn_key("t1").await.unwrap().unwrap();
        assert_eq!(found.id, a.id);
        assert!(store.get_by_turn_key("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_is_oldest_first_and_limited() {
        let store = InMemoryMessageStore::new();
        for i in 0..5 {
            store
                .save(msg(&format!("t{}", i), "c1", &format!("m{}", i)))
                .await
                .unwrap();
        }
        store.save(msg("other", "c2", "x")).await.unwrap();
        let recent = store.recent("c1", 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_latest_attachment() {
        let store = InMemoryMessageStore::new();
        assert!(store.latest_attachment("c1").await.unwrap().is_none());
        store.add_attachment("c1", "s1", "a.pdf").await.unwrap();
        store.add_attachment("c1", "s2", "b.pdf").await.unwrap();
        store.add_attachment("c2", "s3", "c.pdf").await.unwrap();
        let latest = store.latest_attachment("c1").await.unwrap().unwrap();
        assert_eq!(latest.source_id, "s2");
    }
}
