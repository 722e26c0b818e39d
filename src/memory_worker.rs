//! Background distillation of durable memory facts.
//!
//! Finished turns are queued as [`MemoryTask`]s on a bounded channel. A
//! single worker asks the generator for at most one durable fact about the
//! user and writes it to the index. Enqueueing never waits: a full queue
//! drops the task. Worker failures are logged and never reach a turn.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use botmind_core::embedding::truncate_chars;
use botmind_core::models::{Role, Scope};

use crate::error::GenerationError;
use crate::generation::{ChatTurn, GenerationParams, GenerationService};
use crate::knowledge::KnowledgeIndex;

const MAX_FACT_CHARS: usize = 300;
const MAX_EXCHANGE_CHARS: usize = 2000;
const NO_FACT: &str = "NONE";

const DISTILL_INSTRUCTION: &str = "From the exchange below, extract at most one durable fact about \
the user that would help in future conversations (a preference, goal, background detail, or \
ongoing project). Write it as one short third-person sentence. If there is no such fact, reply \
with NONE only.";

#[derive(Debug, Clone)]
pub struct MemoryTask {
    pub scope: Scope,
    pub question: String,
    pub answer: String,
}

/// Producer half of the memory queue. Cheap to clone.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: Option<mpsc::Sender<MemoryTask>>,
}

impl MemoryQueue {
    /// A queue that discards every task.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue `task` without waiting. Returns whether it was accepted.
    pub fn enqueue(&self, task: MemoryTask) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if task.scope.bot_id().is_none() {
            return false;
        }
        match tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(scope = %task.scope, "memory queue full; dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("memory worker stopped; dropping task");
                false
            }
        }
    }
}

/// Start the worker. It exits once every [`MemoryQueue`] clone is dropped.
pub fn spawn_memory_worker(
    knowledge: KnowledgeIndex,
    generator: Arc<dyn GenerationService>,
    capacity: usize,
) -> (MemoryQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<MemoryTask>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            match distill(generator.as_ref(), &task).await {
                Ok(Some(fact)) => {
                    if let Err(e) = knowledge.add_memory(&task.scope, &fact, Role::User).await {
                        tracing::error!(scope = %task.scope, error = %e, "failed to store memory fact");
                    } else {
                        tracing::debug!(scope = %task.scope, "stored memory fact");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(scope = %task.scope, error = %e, "memory distillation failed");
                }
            }
        }
        tracing::debug!("memory worker stopped");
    });
    (MemoryQueue { tx: Some(tx) }, handle)
}

async fn distill(
    generator: &dyn GenerationService,
    task: &MemoryTask,
) -> Result<Option<String>, GenerationError> {
    let exchange = format!(
        "User: {}\nAssistant: {}",
        truncate_chars(&task.question, MAX_EXCHANGE_CHARS),
        truncate_chars(&task.answer, MAX_EXCHANGE_CHARS)
    );
    let params = GenerationParams {
        temperature: 0.0,
        max_tokens: 120,
        web_search: false,
        response_schema: None,
    };
    let reply = generator
        .generate(DISTILL_INSTRUCTION, &[ChatTurn::user(exchange)], &params)
        .await?;
    Ok(clean_fact(&reply))
}

fn clean_fact(reply: &str) -> Option<String> {
    let fact = reply.trim().trim_matches('"').trim();
    if fact.is_empty() || fact.trim_end_matches('.').eq_ignore_ascii_case(NO_FACT) {
        return None;
    }
    Some(truncate_chars(fact, MAX_FACT_CHARS).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{KeywordEmbedder, Reply, ScriptedGenerator};
    use botmind_core::filter::Filter;
    use botmind_core::index::memory::InMemoryIndex;
    use botmind_core::index::VectorIndex;
    use botmind_core::models::RecordKind;

    #[test]
    fn test_clean_fact() {
        assert_eq!(clean_fact("NONE"), None);
        assert_eq!(clean_fact("  none. "), None);
        assert_eq!(
            clean_fact("\"The user is learning Rust.\""),
            Some("The user is learning Rust.".to_string())
        );
    }

    #[tokio::test]
    async fn test_worker_stores_fact_for_bot_scope() {
        let index = Arc::new(InMemoryIndex::new());
        let knowledge = KnowledgeIndex::new(index.clone(), Arc::new(KeywordEmbedder::new()));
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Reply::text("The user likes tea."),
            Reply::Fail,
        ]));
        let (queue, handle) = spawn_memory_worker(knowledge, generator, 4);

        let task = |scope| MemoryTask {
            scope,
            question: "I love tea".into(),
            answer: "Noted!".into(),
        };
        assert!(queue.enqueue(task(Scope::bot(1, 5))));
        assert!(queue.enqueue(task(Scope::bot(1, 5))));
        assert!(!queue.enqueue(task(Scope::study_space(1, 9))));
        drop(queue);
        handle.await.unwrap();

        let metas = index
            .get_all(&Filter::for_scope_kind(&Scope::bot(1, 5), RecordKind::Memory))
            .await
            .unwrap();
        assert_eq!(metas.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_queue_rejects() {
        let queue = MemoryQueue::disabled();
        assert!(!queue.enqueue(MemoryTask {
            scope: Scope::bot(1, 5),
            question: "q".into(),
            answer: "a".into(),
        }));
    }
}
