//! # botmind
//!
//! Retrieval, evidence gating and streamed answering for multi-tenant
//! persona bots.
//!
//! Users own bots and study spaces. Documents indexed into a scope become
//! searchable knowledge for it; finished conversations leave behind short
//! memory facts. For each question botmind picks a retrieval strategy,
//! decides whether the evidence is strong enough to answer under a strict
//! no-hallucination contract, and streams the answer while stripping the
//! follow-up suggestions block the model appends.
//!
//! ## Architecture
//!
//! ```text
//!  question ─▶ StrictBoundary ─▶ Retriever ─▶ KnowledgeIndex ─▶ SQLite
//!                  │   │                         (chunks + memories)
//!                  │   └─▶ gate ─▶ tie-breaker (gray zone only)
//!                  ▼
//!          ContextAssembler ─▶ generation ─▶ StreamingAnswerProcessor
//!                                                 │
//!                                   messages ◀────┴──▶ memory worker
//! ```
//!
//! Pure logic (data model, filters, classifier, gate, suggestion splitter)
//! lives in the `botmind-core` crate; this crate wires it to SQLite, HTTP
//! model providers, an axum API and a CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`db`], [`migrate`] | SQLite connection and schema |
//! | [`embedding`], [`generation`] | Model provider clients |
//! | [`sqlite_index`] | SQLite-backed vector index |
//! | [`knowledge`] | Scoped index operations |
//! | [`messages`], [`sqlite_messages`] | Conversation persistence |
//! | [`retriever`] | Strategy dispatch and memory search |
//! | [`tiebreaker`] | Model arbitration for gray-zone evidence |
//! | [`boundary`] | Response mode decision |
//! | [`context`] | Prompt assembly and deterministic answers |
//! | [`stream`] | Streamed answer processing |
//! | [`memory_worker`] | Background memory distillation |
//! | [`pipeline`] | Turn orchestration |
//! | [`chunk`], [`ingest`] | Plain-text ingestion |
//! | [`server`] | HTTP API |
//! | `testing` | Fake providers for tests (`testing` feature) |

pub mod boundary;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod knowledge;
pub mod memory_worker;
pub mod messages;
pub mod migrate;
pub mod pipeline;
pub mod retriever;
pub mod server;
pub mod sqlite_index;
pub mod sqlite_messages;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tiebreaker;
