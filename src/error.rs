//! Typed errors for external-call boundaries.
//!
//! Every call that leaves the process (embedding, generation) or crosses
//! the persistence boundary returns one of these, so the degrade policy is
//! a `match` at the call site rather than a broad catch:
//!
//! | Error | Degrades to |
//! |-------|-------------|
//! | [`EmbeddingError`] | empty candidate list |
//! | [`ArbitrationError`] | REFUSE (`tiebreaker_error`) |
//! | [`GenerationError`] | terminal `error` event, or partial persistence |
//! | [`PersistError`] | logged; the turn reports failure |
//!
//! [`TurnError`] is what a synchronous turn returns when it has nothing to
//! show for itself.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding request failed: {0}")]
    Http(String),
    #[error("embedding API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation provider is disabled")]
    Disabled,
    #[error("generation request timed out")]
    Timeout,
    #[error("generation request failed: {0}")]
    Http(String),
    #[error("generation API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed generation response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GenerationError::Timeout
        } else {
            GenerationError::Http(e.to_string())
        }
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        EmbeddingError::Http(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("unparseable verdict: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a synchronous turn. Only the primary path surfaces here.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("no answer could be generated: {0}")]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}
