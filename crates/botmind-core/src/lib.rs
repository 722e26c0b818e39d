//! # botmind core
//!
//! Pure, I/O-free logic for botmind: the data model for chunks and memory
//! facts, the metadata filter expression, the [`index::VectorIndex`] trait
//! with a brute-force in-memory backend, query classification, the
//! deterministic evidence gate, the general-search diversity cap, and the
//! streaming splitter that separates answer prose from the trailing
//! suggestions block.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem code. Everything
//! network-bound (embedding, generation, persistence) lives in the `botmind`
//! application crate and is handed to these functions as plain values.

pub mod citations;
pub mod classifier;
pub mod diversity;
pub mod embedding;
pub mod filter;
pub mod gate;
pub mod index;
pub mod intent;
pub mod models;
pub mod suggestions;
