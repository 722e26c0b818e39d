//! Streamed answer processing.
//!
//! [`StreamingAnswerProcessor::process`] pulls text pieces from the model,
//! forwards prose to the client as `chunk` events, captures the trailing
//! suggestions block without ever forwarding it, persists the final
//! assistant message and emits exactly one terminal `end` or `error` event.
//!
//! Failure handling:
//!
//! - generation fails before any text: `error` event, nothing persisted;
//! - generation fails after some text: the partial text is persisted and
//!   reported with `end`;
//! - the client goes away: no more pieces are pulled; partial text is
//!   persisted if there is any;
//! - the suggestions block does not parse: logged, no suggestions.

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use botmind_core::models::{ResponseMode, Role};
use botmind_core::suggestions::{parse_suggestions, SuggestionSplitter};

use crate::generation::TextStream;
use crate::messages::{MessageStore, NewMessage, SourceRef, StoredMessage};

/// Events sent to the transport layer: one `start`, any number of
/// `chunk`s, then exactly one `end` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Start {
        turn_id: String,
    },
    Chunk {
        content: String,
    },
    End {
        message_id: String,
        content: String,
        suggestions: Vec<String>,
        sources: Vec<SourceRef>,
        mode: ResponseMode,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::End { .. } | ChatEvent::Error { .. })
    }
}

/// Where and how the assistant message is persisted.
#[derive(Debug, Clone)]
pub struct PersistTarget {
    pub turn_key: String,
    pub conversation_id: String,
    pub sources: Vec<SourceRef>,
    pub mode: ResponseMode,
}

/// How a streamed answer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(StoredMessage),
    /// Generation failed midway; the partial answer was persisted.
    Partial(StoredMessage),
    /// The client disconnected. Holds the persisted partial answer, if any.
    Cancelled(Option<StoredMessage>),
    /// Nothing was persisted.
    Failed(String),
}

impl StreamOutcome {
    pub fn message(&self) -> Option<&StoredMessage> {
        match self {
            StreamOutcome::Completed(m) | StreamOutcome::Partial(m) => Some(m),
            StreamOutcome::Cancelled(m) => m.as_ref(),
            StreamOutcome::Failed(_) => None,
        }
    }
}

pub struct StreamingAnswerProcessor {
    messages: Arc<dyn MessageStore>,
    separator: String,
    chunk_delay: Duration,
}

impl StreamingAnswerProcessor {
    pub fn new(messages: Arc<dyn MessageStore>, separator: &str, chunk_delay: Duration) -> Self {
        Self {
            messages,
            separator: separator.to_string(),
            chunk_delay,
        }
    }

    pub async fn process(
        &self,
        mut stream: TextStream,
        sink: &mpsc::Sender<ChatEvent>,
        target: PersistTarget,
    ) -> StreamOutcome {
        let mut splitter = SuggestionSplitter::new(&self.separator);
        let mut clean = String::new();
        let mut disconnected = false;
        let mut failure = None;

        loop {
            // No chunk is sent while suggestions are collected.
            if sink.is_closed() {
                disconnected = true;
                break;
            }
            let Some(item) = stream.next().await else {
                break;
            };
            match item {
                Ok(piece) => {
                    let Some(out) = splitter.push(&piece) else {
                        continue;
                    };
                    clean.push_str(&out);
                    if sink.send(ChatEvent::Chunk { content: out }).await.is_err() {
                        disconnected = true;
                        break;
                    }
                    if !self.chunk_delay.is_zero() {
                        tokio::time::sleep(self.chunk_delay).await;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(stream);

        let rest = splitter.finish();
        if !rest.clean_tail.is_empty() {
            clean.push_str(&rest.clean_tail);
            if !disconnected
                && sink
                    .send(ChatEvent::Chunk {
                        content: rest.clean_tail,
                    })
                    .await
                    .is_err()
            {
                disconnected = true;
            }
        }

        if clean.is_empty() {
            if disconnected {
                tracing::info!(turn = %target.turn_key, "client disconnected before any content");
                return StreamOutcome::Cancelled(None);
            }
            let message = match failure {
                Some(e) => {
                    tracing::warn!(turn = %target.turn_key, error = %e, "generation failed before any content");
                    format!("generation failed: {}", e)
                }
                None => {
                    tracing::warn!(turn = %target.turn_key, "model returned no answer text");
                    "the model returned an empty answer".to_string()
                }
            };
            let _ = sink
                .send(ChatEvent::Error {
                    message: message.clone(),
                })
                .await;
            return StreamOutcome::Failed(message);
        }

        let suggestions = if failure.is_some() || disconnected {
            Vec::new()
        } else {
            parse_suggestions(&rest.suggestions_raw).unwrap_or_else(|e| {
                tracing::warn!(turn = %target.turn_key, error = %e, "discarding malformed suggestions");
                Vec::new()
            })
        };

        let saved = self
            .messages
            .save(NewMessage {
                turn_key: target.turn_key.clone(),
                conversation_id: target.conversation_id,
                role: Role::Assistant,
                content: clean,
                suggestions,
                sources: target.sources,
                mode: Some(target.mode),
            })
            .await;
        let stored = match saved {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(turn = %target.turn_key, error = %e, "failed to persist answer");
                let message = format!("failed to save answer: {}", e);
                if !disconnected {
                    let _ = sink
                        .send(ChatEvent::Error {
                            message: message.clone(),
                        })
                        .await;
                }
                return StreamOutcome::Failed(message);
            }
        };

        if disconnected {
            tracing::info!(turn = %target.turn_key, chars = stored.content.len(), "client disconnected; kept partial answer");
            return StreamOutcome::Cancelled(Some(stored));
        }

        let end = ChatEvent::End {
            message_id: stored.id.clone(),
            content: stored.content.clone(),
            suggestions: stored.suggestions.clone(),
            sources: stored.sources.clone(),
            mode: target.mode,
        };
        let _ = sink.send(end).await;

        match failure {
            Some(e) => {
                tracing::warn!(turn = %target.turn_key, error = %e, "generation failed midway; kept partial answer");
                StreamOutcome::Partial(stored)
            }
            None => StreamOutcome::Completed(stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::messages::InMemoryMessageStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pieces(items: Vec<Result<&str, GenerationError>>) -> TextStream {
        let owned: Vec<Result<String, GenerationError>> =
            items.into_iter().map(|r| r.map(str::to_string)).collect();
        futures::stream::iter(owned).boxed()
    }

    fn target() -> PersistTarget {
        PersistTarget {
            turn_key: "t1:assistant".into(),
            conversation_id: "c1".into(),
            sources: vec![],
            mode: ResponseMode::NonStrictWebOrGeneral,
        }
    }

    fn processor(store: Arc<InMemoryMessageStore>) -> StreamingAnswerProcessor {
        StreamingAnswerProcessor::new(store, "|||SUGGESTIONS|||", Duration::ZERO)
    }

    async fn collect(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_separator_never_forwarded() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(64);
        let outcome = processor(store.clone())
            .process(
                pieces(vec![Ok("Context "), Ok("|||SUGG"), Ok("ESTIONS|||"), Ok(r#"["Sug1"]"#)]),
                &tx,
                target(),
            )
            .await;
        drop(tx);
        let events = collect(rx).await;

        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "Context ");
        match events.last().unwrap() {
            ChatEvent::End {
                content,
                suggestions,
                ..
            } => {
                assert_eq!(content, "Context ");
                assert_eq!(suggestions, &vec!["Sug1".to_string()]);
            }
            other => panic!("expected end, got {other:?}"),
        }
        assert!(matches!(outcome, StreamOutcome::Completed(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_before_content_is_error_without_persist() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(64);
        let outcome = processor(store.clone())
            .process(pieces(vec![Err(GenerationError::Timeout)]), &tx, target())
            .await;
        drop(tx);
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChatEvent::Error { .. }));
        assert!(matches!(outcome, StreamOutcome::Failed(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_content_persists_partial() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(64);
        let outcome = processor(store.clone())
            .process(
                pieces(vec![Ok("Half an answer"), Err(GenerationError::Timeout)]),
                &tx,
                target(),
            )
            .await;
        drop(tx);
        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(ChatEvent::End { .. })));
        match outcome {
            StreamOutcome::Partial(m) => assert_eq!(m.content, "Half an answer"),
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_suggestions_ignored() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, _rx) = mpsc::channel(64);
        let outcome = processor(store)
            .process(pieces(vec![Ok("Answer.|||SUGGESTIONS|||[not json")]), &tx, target())
            .await;
        let msg = outcome.message().unwrap();
        assert_eq!(msg.content, "Answer.");
        assert!(msg.suggestions.is_empty());
    }

    /// Yields `items`, dropping `rx` while handing out piece number
    /// `drop_at` (1-based). Returns the stream and a pull counter.
    fn dropping_receiver_at(
        items: Vec<String>,
        rx: Option<mpsc::Receiver<ChatEvent>>,
        drop_at: usize,
    ) -> (TextStream, Arc<AtomicUsize>) {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let rx = Mutex::new(rx);
        let stream: TextStream = futures::stream::iter(items)
            .map(move |piece| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == drop_at {
                    rx.lock().unwrap().take();
                }
                Ok(piece)
            })
            .boxed();
        (stream, pulled)
    }

    #[tokio::test]
    async fn test_disconnect_during_suggestions_stops_pulling() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(64);
        let mut items = vec![
            "Answer.".to_string(),
            "|||SUGGESTIONS|||".to_string(),
            "[\"one\"".to_string(),
        ];
        items.extend((0..99).map(|i| format!(", \"more {}\"", i)));
        let (stream, pulled) = dropping_receiver_at(items, Some(rx), 3);

        let outcome = processor(store.clone())
            .process(stream, &tx, target())
            .await;

        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        match outcome {
            StreamOutcome::Cancelled(Some(m)) => {
                assert_eq!(m.content, "Answer.");
                assert!(m.suggestions.is_empty());
            }
            other => panic!("expected cancelled with message, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_mid_answer_keeps_partial_content() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(64);
        let items = vec![
            "First part. ".to_string(),
            "Second part.".to_string(),
            "never pulled".to_string(),
        ];
        let (stream, pulled) = dropping_receiver_at(items, Some(rx), 2);

        let outcome = processor(store.clone())
            .process(stream, &tx, target())
            .await;

        assert_eq!(pulled.load(Ordering::SeqCst), 2);
        match outcome {
            StreamOutcome::Cancelled(Some(m)) => {
                assert!(m.content.starts_with("First part."));
                assert!(!m.content.contains("never"));
            }
            other => panic!("expected cancelled with message, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_sink_pulls_nothing() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (stream, pulled) = dropping_receiver_at(vec!["never pulled".to_string()], None, 0);
        let outcome = processor(store.clone())
            .process(stream, &tx, target())
            .await;
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert_eq!(outcome, StreamOutcome::Cancelled(None));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_persists_nothing() {
        let store = Arc::new(InMemoryMessageStore::new());
        let (tx, rx) = mpsc::channel(1);
        let outcome = processor(store.clone())
            .process(pieces(vec![]), &tx, target())
            .await;
        drop(tx);
        let events = collect(rx).await;
        assert!(matches!(events.as_slice(), [ChatEvent::Error { .. }]));
        assert!(matches!(outcome, StreamOutcome::Failed(_)));
        assert!(store.is_empty());
    }
}
