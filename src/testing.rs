//! Deterministic service fakes for tests and offline runs.
//!
//! - [`KeywordEmbedder`] hashes words into a small vector space, and lets a
//!   test pin exact vectors for exact texts so distances are predictable.
//! - [`ScriptedGenerator`] replays a queue of scripted replies and records
//!   every call it receives.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use botmind_core::embedding::EmbeddingTask;

use crate::embedding::EmbeddingService;
use crate::error::{EmbeddingError, GenerationError};
use crate::generation::{ChatTurn, GenerationParams, GenerationService, TextStream};

const KEYWORD_DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase word adds weight to one of 64
/// buckets (FNV-1a hash).
#[derive(Default)]
pub struct KeywordEmbedder {
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `vector` whenever exactly `text` is embedded.
    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        if let Ok(mut pinned) = self.pinned.lock() {
            pinned.insert(text.to_string(), vector);
        }
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector this embedder produces for `text` when nothing is pinned.
    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; KEYWORD_DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hash: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            v[(hash % KEYWORD_DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingService for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    async fn embed(&self, text: &str, _task: EmbeddingTask) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Http("scripted failure".into()));
        }
        let pinned = self
            .pinned
            .lock()
            .ok()
            .and_then(|p| p.get(text).cloned());
        Ok(pinned.unwrap_or_else(|| Self::vector_for(text)))
    }
}

/// One scripted generator reply.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Whole text; streamed as a single piece.
    Text(String),
    /// Streamed piece by piece; joined for one-shot calls.
    Pieces(Vec<String>),
    /// Streams the pieces, then fails.
    PiecesThenFail(Vec<String>),
    /// Fails before producing anything.
    Fail,
}

impl Reply {
    pub fn text(s: &str) -> Self {
        Reply::Text(s.to_string())
    }

    pub fn pieces(parts: &[&str]) -> Self {
        Reply::Pieces(parts.iter().map(|p| p.to_string()).collect())
    }
}

/// A recorded generator call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub contents: Vec<ChatTurn>,
    pub params: GenerationParams,
    pub streamed: bool,
}

/// Generator that replays [`Reply`] values in order. Once the script is
/// exhausted every call returns the fallback text.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Reply>>,
    fallback: String,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: "NONE".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: &str) -> Self {
        self.fallback = fallback.to_string();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next(&self, system: &str, contents: &[ChatTurn], params: &GenerationParams, streamed: bool) -> Reply {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                system: system.to_string(),
                contents: contents.to_vec(),
                params: params.clone(),
                streamed,
            });
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| Reply::Text(self.fallback.clone()))
    }
}

fn scripted_failure() -> GenerationError {
    GenerationError::Http("scripted failure".into())
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        match self.next(system, contents, params, false) {
            Reply::Text(t) => Ok(t),
            Reply::Pieces(p) => Ok(p.concat()),
            Reply::PiecesThenFail(_) | Reply::Fail => Err(scripted_failure()),
        }
    }

    async fn generate_stream(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<TextStream, GenerationError> {
        let items: Vec<Result<String, GenerationError>> =
            match self.next(system, contents, params, true) {
                Reply::Text(t) => vec![Ok(t)],
                Reply::Pieces(p) => p.into_iter().map(Ok).collect(),
                Reply::PiecesThenFail(p) => p
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(scripted_failure())))
                    .collect(),
                Reply::Fail => return Err(scripted_failure()),
            };
        Ok(futures::stream::iter(items).boxed())
    }
}
