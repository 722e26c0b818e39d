//! Text generation service abstraction and implementations.
//!
//! [`GenerationService`] exposes a one-shot [`generate`](GenerationService::generate)
//! and an incremental [`generate_stream`](GenerationService::generate_stream).
//! Every failure is a [`GenerationError`]; the pipeline decides per call site
//! whether that becomes a refusal, an `error` event, or partial persistence.
//!
//! - **[`DisabledGenerator`]**: always fails with [`GenerationError::Disabled`].
//! - **[`OpenAIGenerator`]**: OpenAI-compatible `/chat/completions`, with SSE
//!   parsing for the streamed variant.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use botmind_core::models::Role;

use crate::config::GenerationConfig;
use crate::error::GenerationError;

/// One prior or current message sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Let the backend ground the answer with web search, if it supports it.
    pub web_search: bool,
    /// JSON schema the response must conform to.
    pub response_schema: Option<serde_json::Value>,
}

impl GenerationParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            web_search: false,
            response_schema: None,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// Incremental model output. A mid-stream `Err` ends the stream.
pub type TextStream = BoxStream<'static, Result<String, GenerationError>>;

#[async_trait]
pub trait GenerationService: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;

    async fn generate_stream(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<TextStream, GenerationError>;
}

/// Build the generation service for `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn GenerationService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl GenerationService for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _system: &str,
        _contents: &[ChatTurn],
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        Err(GenerationError::Disabled)
    }

    async fn generate_stream(
        &self,
        _system: &str,
        _contents: &[ChatTurn],
        _params: &GenerationParams,
    ) -> Result<TextStream, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// Generator for the OpenAI chat completions API (or any compatible endpoint).
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
        })
    }

    fn request_body(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
        stream: bool,
    ) -> serde_json::Value {
        let mut messages = Vec::with_capacity(contents.len() + 1);
        if !system.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for turn in contents {
            messages.push(serde_json::json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        });
        if let Some(schema) = &params.response_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema, "strict": true},
            });
        }
        if params.web_search {
            body["web_search_options"] = serde_json::json!({});
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, GenerationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(300).collect();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: preview,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationService for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let body = self.request_body(system, contents, params, false);
        tracing::debug!(model = %self.model, turns = contents.len(), "generation request");
        let response = self.send(&body).await?;
        let json: serde_json::Value = response.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GenerationError::Decode("missing choices[0].message.content".into()))
    }

    async fn generate_stream(
        &self,
        system: &str,
        contents: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<TextStream, GenerationError> {
        let body = self.request_body(system, contents, params, true);
        tracing::debug!(model = %self.model, turns = contents.len(), "streaming generation request");
        let response = self.send(&body).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(GenerationError::from(e));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim()) {
                        SseLine::Content(text) => yield Ok(text),
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

/// Interpret one line of an OpenAI-style SSE response.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(parsed) => match parsed["choices"][0]["delta"]["content"].as_str() {
            Some(content) if !content.is_empty() => SseLine::Content(content.to_string()),
            _ => SseLine::Skip,
        },
        Err(_) => SseLine::Skip,
    }
}
