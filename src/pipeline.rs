//! Turn orchestration.
//!
//! A turn runs: persist the user message → decide the response mode →
//! render (deterministic modes) or assemble and generate → persist the
//! assistant message → queue memory distillation.
//!
//! [`ChatPipeline::respond`] returns the persisted reply in one piece and
//! enforces the citation guardrail: an uncited strict answer is replaced by
//! the output of exactly one refusal call. [`ChatPipeline::respond_stream`]
//! emits [`ChatEvent`]s into a channel; a streamed answer cannot be taken
//! back, so a missing citation there is only logged.
//!
//! Messages are keyed `"{turn_id}:user"` and `"{turn_id}:assistant"`. A turn
//! retried with an id that already has an assistant message gets that
//! message back, or replayed as events, and the model is not called again.

use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use botmind_core::citations::has_citation_marker;
use botmind_core::index::VectorIndex;
use botmind_core::models::{ResponseMode, Role, Scope};
use botmind_core::suggestions::{parse_suggestions, split_complete};

use crate::boundary::{BoundaryDecision, StrictBoundary};
use crate::config::Config;
use crate::context::{render_refusal, render_source_list, BotProfile, ContextAssembler};
use crate::db;
use crate::embedding::{create_embedder, EmbeddingService};
use crate::error::{PersistError, TurnError};
use crate::generation::{
    create_generator, ChatTurn, GenerationParams, GenerationService, TextStream,
};
use crate::knowledge::KnowledgeIndex;
use crate::memory_worker::{spawn_memory_worker, MemoryQueue, MemoryTask};
use crate::messages::{MessageStore, NewMessage, SourceRef, StoredMessage};
use crate::retriever::{Retrieval, Retriever};
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_messages::SqliteMessageStore;
use crate::stream::{ChatEvent, PersistTarget, StreamOutcome, StreamingAnswerProcessor};
use crate::tiebreaker::EvidenceTiebreaker;

const REPLAYED: &str = "replayed stored answer";

/// One user question.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub scope: Scope,
    pub conversation_id: String,
    pub question: String,
    /// Idempotency id for the turn; generated when absent.
    pub turn_id: Option<String>,
}

impl TurnRequest {
    pub fn new(scope: Scope, conversation_id: &str, question: &str) -> Self {
        Self {
            scope,
            conversation_id: conversation_id.to_string(),
            question: question.to_string(),
            turn_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub turn_id: String,
    pub mode: ResponseMode,
    pub reason: String,
    pub message: StoredMessage,
    /// True when an uncited strict answer was replaced by a refusal.
    pub guardrail_applied: bool,
}

/// External collaborators of a pipeline.
#[derive(Clone)]
pub struct Services {
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn EmbeddingService>,
    pub generator: Arc<dyn GenerationService>,
    pub messages: Arc<dyn MessageStore>,
}

pub struct ChatPipeline {
    boundary: StrictBoundary,
    retriever: Retriever,
    assembler: ContextAssembler,
    processor: StreamingAnswerProcessor,
    generator: Arc<dyn GenerationService>,
    messages: Arc<dyn MessageStore>,
    memory: MemoryQueue,
    params: GenerationParams,
    separator: String,
    history_limit: usize,
}

struct Answer {
    content: String,
    suggestions: Vec<String>,
    sources: Vec<SourceRef>,
    guardrail_applied: bool,
}

impl ChatPipeline {
    pub fn new(config: &Config, services: Services, memory: MemoryQueue) -> Self {
        let knowledge = KnowledgeIndex::new(services.index, services.embedder);
        let retriever = Retriever::new(
            knowledge,
            services.messages.clone(),
            config.retrieval.clone(),
        );
        let tiebreaker =
            EvidenceTiebreaker::new(services.generator.clone(), config.tiebreaker.clone());
        let boundary =
            StrictBoundary::new(retriever.clone(), tiebreaker, config.retrieval.threshold);
        let processor = StreamingAnswerProcessor::new(
            services.messages.clone(),
            &config.streaming.separator,
            Duration::from_millis(config.streaming.chunk_delay_ms),
        );

        Self {
            boundary,
            retriever,
            assembler: ContextAssembler::new(&config.streaming.separator),
            processor,
            generator: services.generator,
            messages: services.messages,
            memory,
            params: GenerationParams::from_config(&config.generation),
            separator: config.streaming.separator.clone(),
            history_limit: config.chat.history_limit,
        }
    }

    pub fn knowledge(&self) -> &KnowledgeIndex {
        self.retriever.knowledge()
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    /// Answer a question and return the persisted reply.
    pub async fn respond(&self, bot: &BotProfile, req: TurnRequest) -> Result<TurnReply, TurnError> {
        let turn_id = turn_id(&req);
        if let Some((message, mode)) = self.stored_answer(&req, &turn_id).await? {
            tracing::info!(turn = %turn_id, "turn already answered; returning stored reply");
            return Ok(TurnReply {
                turn_id,
                mode,
                reason: REPLAYED.to_string(),
                message,
                guardrail_applied: false,
            });
        }
        let history = self.history(&req.conversation_id).await;
        self.save_user(&turn_id, &req).await?;
        let decision = self.decide(bot, &req).await;

        let answer = if decision.mode.is_deterministic() {
            Answer {
                content: self.deterministic_text(bot, &decision).await,
                suggestions: Vec::new(),
                sources: Vec::new(),
                guardrail_applied: false,
            }
        } else {
            self.generate_answer(bot, &req, &decision, &history).await?
        };

        let message = self
            .messages
            .save(NewMessage {
                turn_key: assistant_key(&turn_id),
                conversation_id: req.conversation_id.clone(),
                role: Role::Assistant,
                content: answer.content,
                suggestions: answer.suggestions,
                sources: answer.sources,
                mode: Some(decision.mode),
            })
            .await?;

        if !decision.mode.is_deterministic() && !answer.guardrail_applied {
            self.remember(&req, &message);
        }

        Ok(TurnReply {
            turn_id,
            mode: decision.mode,
            reason: decision.reason,
            message,
            guardrail_applied: answer.guardrail_applied,
        })
    }

    /// Answer a question as a stream of events sent into `sink`.
    ///
    /// Emits one `start`, any number of `chunk`s and exactly one `end` or
    /// `error` (unless the receiver is dropped first).
    pub async fn respond_stream(
        &self,
        bot: &BotProfile,
        req: TurnRequest,
        sink: mpsc::Sender<ChatEvent>,
    ) -> StreamOutcome {
        let turn_id = turn_id(&req);
        if sink
            .send(ChatEvent::Start {
                turn_id: turn_id.clone(),
            })
            .await
            .is_err()
        {
            return StreamOutcome::Cancelled(None);
        }

        match self.stored_answer(&req, &turn_id).await {
            Ok(Some((message, mode))) => {
                tracing::info!(turn = %turn_id, "turn already answered; replaying stored reply");
                return replay(message, mode, &sink).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(turn = %turn_id, error = %e, "failed to look up stored answer");
                let message = e.to_string();
                let _ = sink
                    .send(ChatEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                return StreamOutcome::Failed(message);
            }
        }

        let history = self.history(&req.conversation_id).await;
        if let Err(e) = self.save_user(&turn_id, &req).await {
            tracing::error!(turn = %turn_id, error = %e, "failed to persist question");
            let message = e.to_string();
            let _ = sink
                .send(ChatEvent::Error {
                    message: message.clone(),
                })
                .await;
            return StreamOutcome::Failed(message);
        }
        let decision = self.decide(bot, &req).await;

        let mut target = PersistTarget {
            turn_key: assistant_key(&turn_id),
            conversation_id: req.conversation_id.clone(),
            sources: Vec::new(),
            mode: decision.mode,
        };

        if decision.mode.is_deterministic() {
            let text = self.deterministic_text(bot, &decision).await;
            let stream: TextStream = futures::stream::iter(vec![Ok(text)]).boxed();
            return self.processor.process(stream, &sink, target).await;
        }

        let retrieval = self.evidence(&req, &decision).await;
        let prompt = self.assembler.assemble(
            bot,
            &req.question,
            decision.mode,
            retrieval.as_ref(),
            &history,
        );
        let params = self.params_for(&decision);
        let source_count = prompt.sources.len();
        target.sources = prompt.sources;

        let stream = match self
            .generator
            .generate_stream(&prompt.system, &prompt.contents, &params)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(turn = %turn_id, error = %e, "generation failed to start");
                let message = format!("generation failed: {}", e);
                let _ = sink
                    .send(ChatEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                return StreamOutcome::Failed(message);
            }
        };

        let outcome = self.processor.process(stream, &sink, target).await;
        if let Some(message) = outcome.message() {
            if decision.mode == ResponseMode::StrictAnswerWithContext
                && !has_citation_marker(&message.content, source_count)
            {
                tracing::warn!(turn = %turn_id, "streamed strict answer has no citation marker");
            }
            self.remember(&req, message);
        }
        outcome
    }

    async fn decide(&self, bot: &BotProfile, req: &TurnRequest) -> BoundaryDecision {
        self.boundary
            .decide_response_mode(
                &req.question,
                bot.strict,
                bot.web_search_allowed,
                &req.scope,
                Some(&req.conversation_id),
            )
            .await
    }

    async fn generate_answer(
        &self,
        bot: &BotProfile,
        req: &TurnRequest,
        decision: &BoundaryDecision,
        history: &[StoredMessage],
    ) -> Result<Answer, TurnError> {
        let retrieval = self.evidence(req, decision).await;
        let prompt = self.assembler.assemble(
            bot,
            &req.question,
            decision.mode,
            retrieval.as_ref(),
            history,
        );
        let params = self.params_for(decision);
        let raw = self
            .generator
            .generate(&prompt.system, &prompt.contents, &params)
            .await?;

        let (answer, raw_suggestions) = split_complete(&raw, &self.separator);
        let answer = answer.trim().to_string();

        if decision.mode == ResponseMode::StrictAnswerWithContext
            && !has_citation_marker(&answer, prompt.sources.len())
        {
            tracing::info!(scope = %req.scope, "strict answer without citations; refusing instead");
            return Ok(Answer {
                content: self.guardrail_refusal(bot, &req.question).await,
                suggestions: Vec::new(),
                sources: Vec::new(),
                guardrail_applied: true,
            });
        }

        let suggestions = parse_suggestions(&raw_suggestions).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "discarding malformed suggestions");
            Vec::new()
        });
        Ok(Answer {
            content: answer,
            suggestions,
            sources: prompt.sources,
            guardrail_applied: false,
        })
    }

    /// The single extra call made for an uncited strict answer.
    async fn guardrail_refusal(&self, bot: &BotProfile, question: &str) -> String {
        let params = GenerationParams {
            response_schema: None,
            web_search: false,
            ..self.params.clone()
        };
        match self
            .generator
            .generate(
                &self.assembler.refusal_instruction(bot),
                &[ChatTurn::user(question)],
                &params,
            )
            .await
        {
            Ok(text) => {
                let (text, _) = split_complete(&text, &self.separator);
                let text = text.trim();
                if text.is_empty() || has_citation_marker(text, usize::MAX) {
                    render_refusal()
                } else {
                    text.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "refusal generation failed; using template");
                render_refusal()
            }
        }
    }

    async fn deterministic_text(&self, bot: &BotProfile, decision: &BoundaryDecision) -> String {
        let template = match decision.mode {
            ResponseMode::ListSources => render_source_list(&decision.listed_sources),
            _ => render_refusal(),
        };
        if !bot.persona_rewrite {
            return template;
        }

        let params = GenerationParams {
            response_schema: None,
            web_search: false,
            ..self.params.clone()
        };
        match self
            .generator
            .generate(
                &self.assembler.rewrite_instruction(bot),
                &[ChatTurn::user(template.clone())],
                &params,
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => template,
            Err(e) => {
                tracing::warn!(error = %e, "persona rewrite failed; using template");
                template
            }
        }
    }

    /// Evidence for prompt construction. Non-strict turns retrieve here,
    /// since the boundary skips retrieval for them.
    async fn evidence(&self, req: &TurnRequest, decision: &BoundaryDecision) -> Option<Retrieval> {
        match &decision.retrieval {
            Some(r) => Some(r.clone()),
            None => Some(
                self.retriever
                    .retrieve(&req.question, &req.scope, Some(&req.conversation_id))
                    .await,
            ),
        }
    }

    fn params_for(&self, decision: &BoundaryDecision) -> GenerationParams {
        GenerationParams {
            web_search: decision.web_search,
            ..self.params.clone()
        }
    }

    async fn history(&self, conversation_id: &str) -> Vec<StoredMessage> {
        if self.history_limit == 0 {
            return Vec::new();
        }
        self.messages
            .recent(conversation_id, self.history_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(conversation = conversation_id, error = %e, "could not load history");
                Vec::new()
            })
    }

    /// The assistant message of a caller-supplied turn id that was already
    /// answered.
    async fn stored_answer(
        &self,
        req: &TurnRequest,
        turn_id: &str,
    ) -> Result<Option<(StoredMessage, ResponseMode)>, PersistError> {
        if req.turn_id.is_none() {
            return Ok(None);
        }
        let found = self
            .messages
            .get_by_turn_key(&assistant_key(turn_id))
            .await?;
        Ok(found.and_then(|m| {
            let mode = m.mode?;
            Some((m, mode))
        }))
    }

    async fn save_user(&self, turn_id: &str, req: &TurnRequest) -> Result<(), PersistError> {
        self.messages
            .save(NewMessage {
                turn_key: format!("{}:user", turn_id),
                conversation_id: req.conversation_id.clone(),
                role: Role::User,
                content: req.question.clone(),
                suggestions: Vec::new(),
                sources: Vec::new(),
                mode: None,
            })
            .await?;
        Ok(())
    }

    fn remember(&self, req: &TurnRequest, message: &StoredMessage) {
        self.memory.enqueue(MemoryTask {
            scope: req.scope,
            question: req.question.clone(),
            answer: message.content.clone(),
        });
    }
}

fn turn_id(req: &TurnRequest) -> String {
    req.turn_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn assistant_key(turn_id: &str) -> String {
    format!("{}:assistant", turn_id)
}

/// Send a stored answer as one chunk and its `end` event.
async fn replay(
    message: StoredMessage,
    mode: ResponseMode,
    sink: &mpsc::Sender<ChatEvent>,
) -> StreamOutcome {
    if !message.content.is_empty()
        && sink
            .send(ChatEvent::Chunk {
                content: message.content.clone(),
            })
            .await
            .is_err()
    {
        return StreamOutcome::Cancelled(Some(message));
    }
    let end = ChatEvent::End {
        message_id: message.id.clone(),
        content: message.content.clone(),
        suggestions: message.suggestions.clone(),
        sources: message.sources.clone(),
        mode,
    };
    if sink.send(end).await.is_err() {
        return StreamOutcome::Cancelled(Some(message));
    }
    StreamOutcome::Completed(message)
}

/// A pipeline over the configured database and providers.
///
/// When memory is enabled the worker handle is returned; it finishes once
/// the pipeline is dropped.
pub async fn open(config: &Config) -> Result<(ChatPipeline, Option<JoinHandle<()>>)> {
    let pool = db::open(config).await?;
    let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool.clone()));
    let messages: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(pool));
    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.generation)?;

    let (memory, worker) = if config.memory.enabled {
        let (queue, handle) = spawn_memory_worker(
            KnowledgeIndex::new(index.clone(), embedder.clone()),
            generator.clone(),
            config.memory.queue_capacity,
        );
        (queue, Some(handle))
    } else {
        (MemoryQueue::disabled(), None)
    };

    let services = Services {
        index,
        embedder,
        generator,
        messages,
    };
    Ok((ChatPipeline::new(config, services, memory), worker))
}
