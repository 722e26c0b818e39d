//! TOML configuration parsing and validation.
//!
//! botmind is configured from one TOML file (default `config/botmind.toml`).
//! Only `[db]` and `[server]` are required; every other section falls back
//! to defaults tuned for a strict, document-grounded bot.
//!
//! ```toml
//! [db]
//! path = "./data/botmind.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7440"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [retrieval]
//! threshold = 0.45
//! ```
//!
//! API keys are read from `OPENAI_API_KEY`, never from the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use botmind_core::suggestions::DEFAULT_SEPARATOR;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub tiebreaker: TiebreakerConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    /// Inputs are truncated to this many characters before embedding.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: default_base_url(),
            timeout_secs: default_generation_timeout(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Base evidence threshold; the gate derives its bands from it.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Candidates farther than this are dropped before diversity selection.
    #[serde(default = "default_similarity_cutoff")]
    pub similarity_cutoff: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    #[serde(default = "default_max_comparative_sources")]
    pub max_comparative_sources: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            similarity_cutoff: default_similarity_cutoff(),
            limit: default_limit(),
            memory_limit: default_memory_limit(),
            max_comparative_sources: default_max_comparative_sources(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TiebreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// ANSWER verdicts below this confidence are downgraded to REFUSE.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_question_chars")]
    pub question_chars: usize,
    #[serde(default = "default_content_chars")]
    pub content_chars: usize,
}

impl Default for TiebreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: default_min_confidence(),
            question_chars: default_question_chars(),
            content_chars: default_content_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Pause between flushed chunks, for a steady typing rate.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_generation_timeout() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.4
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_threshold() -> f64 {
    0.45
}
fn default_similarity_cutoff() -> f64 {
    0.60
}
fn default_limit() -> usize {
    6
}
fn default_memory_limit() -> usize {
    3
}
fn default_max_comparative_sources() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_min_confidence() -> f64 {
    0.65
}
fn default_question_chars() -> usize {
    250
}
fn default_content_chars() -> usize {
    350
}
fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}
fn default_chunk_delay_ms() -> u64 {
    12
}
fn default_queue_capacity() -> usize {
    256
}
fn default_history_limit() -> usize {
    10
}
fn default_max_tokens() -> usize {
    400
}

impl Config {
    /// Configuration with every optional section at its default.
    ///
    /// Used by tests and by embedders that construct services directly.
    pub fn with_db(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            server: ServerConfig {
                bind: "127.0.0.1:7440".to_string(),
            },
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            tiebreaker: TiebreakerConfig::default(),
            streaming: StreamingConfig::default(),
            memory: MemoryConfig::default(),
            chat: ChatConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let r = &config.retrieval;
    if !(r.threshold > 0.0 && r.threshold < 2.0) {
        bail!("retrieval.threshold must be in (0.0, 2.0)");
    }
    if !(r.similarity_cutoff > 0.0 && r.similarity_cutoff <= 2.0) {
        bail!("retrieval.similarity_cutoff must be in (0.0, 2.0]");
    }
    if r.limit < 1 {
        bail!("retrieval.limit must be >= 1");
    }
    if r.max_comparative_sources < 1 {
        bail!("retrieval.max_comparative_sources must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.tiebreaker.min_confidence) {
        bail!("tiebreaker.min_confidence must be in [0.0, 1.0]");
    }
    if config.streaming.separator.is_empty() {
        bail!("streaming.separator must not be empty");
    }
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.generation.model.is_none() {
                bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!(
            "[db]\npath = \"/tmp/x.sqlite\"\n\n[server]\nbind = \"127.0.0.1:1\"\n{}",
            extra
        );
        let cfg: Config = toml::from_str(&text)?;
        validate(&cfg)?;
        Ok(cfg)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.retrieval.threshold, 0.45);
        assert_eq!(cfg.retrieval.similarity_cutoff, 0.60);
        assert_eq!(cfg.tiebreaker.min_confidence, 0.65);
        assert_eq!(cfg.streaming.separator, "|||SUGGESTIONS|||");
        assert!(!cfg.embedding.is_enabled());
        assert!(!cfg.generation.is_enabled());
    }

    #[test]
    fn test_openai_embedding_requires_model_and_dims() {
        assert!(parse("[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\ndims = 8\n").is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(parse("[generation]\nprovider = \"mystery\"\n").is_err());
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(parse("[retrieval]\nthreshold = 0.0\n").is_err());
        assert!(parse("[retrieval]\nthreshold = 0.5\n").is_ok());
    }

    #[test]
    fn test_empty_separator_rejected() {
        assert!(parse("[streaming]\nseparator = \"\"\n").is_err());
    }
}
