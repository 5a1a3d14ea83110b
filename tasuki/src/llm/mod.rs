//! Uniform LLM call surface over heterogeneous providers.
//!
//! An [`LlmProvider`] exposes streaming and non-streaming generation; the
//! [`Llms`] adapter routes each request across an ordered provider pool,
//! retrying transient failures with exponential backoff and decorating every
//! call with the task's abort signal.

mod mock;
mod openai;

pub use mock::{MockProvider, MockTurn};
pub use openai::{OpenAiProvider, OpenAiProviderBuilder};

use std::collections::HashMap;
use std::future::Future;
use std::ops::{Add, AddAssign};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, RetryPolicy};
use crate::context::AbortSignal;
use crate::error::{LlmError, TaskError};
use crate::message::{LlmMessage, MessagePart, ToolUse};
use crate::tool::ToolDefinition;

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub input_tokens: u32,
    /// Tokens in the completion.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Create new token usage with the given counts.
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total token count.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Why a completion stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural end of the response.
    #[default]
    Stop,
    /// The model requested tool calls.
    ToolCalls,
    /// The output token limit was reached.
    Length,
    /// The provider's content filter fired.
    ContentFilter,
    /// The turn ended with an error.
    Error,
}

impl FinishReason {
    /// Map an OpenAI-style finish reason string.
    #[must_use]
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }
}

/// How the model is allowed to pick tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// The model must not call tools.
    None,
    /// The model must call at least one tool.
    Required,
    /// The model must call the named tool.
    Tool(String),
}

/// A request to a language model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Conversation history.
    pub messages: Vec<LlmMessage>,
    /// Tools available for function calling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Tool selection constraint.
    #[serde(default)]
    pub tool_choice: ToolChoice,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Output token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl LlmRequest {
    /// Create a request from a conversation.
    #[must_use]
    pub fn new(messages: Vec<LlmMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Set the available tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the tool choice constraint.
    #[must_use]
    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output token cap.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One event in a model response stream.
///
/// Providers that assemble tool calls from deltas must emit a final
/// [`StreamChunk::ToolCall`] for every completed call before
/// [`StreamChunk::Finish`]; consumers rely on complete calls rather than
/// re-assembling deltas themselves.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StreamChunk {
    /// Incremental answer text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning text.
    ReasoningDelta {
        /// The reasoning fragment.
        text: String,
    },
    /// Incremental tool-call arguments.
    ToolCallDelta {
        /// Id of the call being accumulated.
        tool_call_id: String,
        /// Tool name, once known.
        tool_name: String,
        /// The argument text fragment.
        args_delta: String,
    },
    /// A fully assembled tool call.
    ToolCall(ToolUse),
    /// Terminal chunk carrying the finish reason and usage.
    Finish {
        /// Why the response stopped.
        reason: FinishReason,
        /// Token usage for the call.
        usage: TokenUsage,
    },
}

/// A boxed stream of response chunks.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// A complete (non-streaming) model response.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Ordered response parts (text, reasoning, tool calls).
    pub content: Vec<MessagePart>,
    /// Why the response stopped.
    pub finish_reason: FinishReason,
    /// Token usage for the call.
    pub usage: TokenUsage,
}

impl GenerateResult {
    /// Concatenated text content of the response.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessagePart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls contained in the response, in emission order.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        self.content
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolUse(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

/// Fold a drained chunk sequence into a [`GenerateResult`].
#[must_use]
pub fn aggregate_chunks(chunks: Vec<StreamChunk>) -> GenerateResult {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut content = Vec::new();
    let mut finish_reason = FinishReason::default();
    let mut usage = TokenUsage::default();

    for chunk in chunks {
        match chunk {
            StreamChunk::TextDelta { text: t } => text.push_str(&t),
            StreamChunk::ReasoningDelta { text: t } => reasoning.push_str(&t),
            StreamChunk::ToolCall(call) => content.push(MessagePart::ToolUse(call)),
            StreamChunk::Finish { reason, usage: u } => {
                finish_reason = reason;
                usage = u;
            }
            StreamChunk::ToolCallDelta { .. } => {}
        }
    }

    let mut parts = Vec::new();
    if !reasoning.is_empty() {
        parts.push(MessagePart::Thinking { text: reasoning });
    }
    if !text.is_empty() {
        parts.push(MessagePart::text(text));
    }
    parts.extend(content);

    GenerateResult {
        content: parts,
        finish_reason,
        usage,
    }
}

/// The interface every LLM provider implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used in errors and logs.
    fn name(&self) -> &str;

    /// Open a streaming response.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] classified for the adapter's retry decision.
    async fn stream(
        &self,
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<LlmStream, LlmError>;

    /// Produce a complete response.
    ///
    /// The default drains [`LlmProvider::stream`].
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] classified for the adapter's retry decision.
    async fn generate(
        &self,
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<GenerateResult, LlmError> {
        let mut stream = self.stream(request, signal).await?;
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            chunks.push(item?);
        }
        if chunks.is_empty() {
            return Err(LlmError::EmptyStream);
        }
        Ok(aggregate_chunks(chunks))
    }
}

/// Connection settings for a provider, as supplied in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDescriptor {
    /// Provider kind (currently `"openai"` or `"openai-compatible"`).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// API key; falls back to the provider's environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL override for compatible gateways.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl LlmDescriptor {
    /// Build the provider this descriptor names.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] for unknown provider kinds.
    pub fn into_provider(self) -> Result<Arc<dyn LlmProvider>, TaskError> {
        match self.provider.as_str() {
            "openai" | "openai-compatible" => {
                let mut builder = OpenAiProvider::builder().model(self.model);
                if let Some(key) = self.api_key {
                    builder = builder.api_key(key);
                }
                if let Some(url) = self.base_url {
                    builder = builder.base_url(url);
                }
                Ok(Arc::new(builder.build()?))
            }
            other => Err(TaskError::config(format!("unknown llm provider '{other}'"))),
        }
    }
}

/// The pool-routing, retrying LLM adapter.
#[derive(Clone)]
pub struct Llms {
    pools: HashMap<String, Vec<Arc<dyn LlmProvider>>>,
    retry: RetryPolicy,
}

impl Llms {
    /// Build the adapter from a runtime configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            pools: config.llms.clone(),
            retry: config.retry,
        }
    }

    /// Providers for the given keys, flattened in declared order.
    fn candidates(&self, keys: &[String]) -> Vec<Arc<dyn LlmProvider>> {
        let mut out = Vec::new();
        for key in keys {
            if let Some(pool) = self.pools.get(key) {
                out.extend(pool.iter().cloned());
            } else {
                warn!(key = %key, "No provider pool for llm key");
            }
        }
        out
    }

    /// Open a streaming response through the pool.
    ///
    /// The first chunk is probed eagerly so that empty streams and
    /// immediately failing streams participate in the retry loop; the
    /// probed chunk is re-injected into the returned stream.
    ///
    /// # Errors
    ///
    /// Returns the final non-retryable error, [`LlmError::Aborted`] when the
    /// signal fires, or [`LlmError::PoolExhausted`] after all attempts.
    pub async fn stream(
        &self,
        keys: &[String],
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<LlmStream, LlmError> {
        self.with_retries(keys, signal, |provider| {
            let request = request.clone();
            let signal = signal.clone();
            async move {
                let mut stream = provider.stream(&request, &signal).await?;
                match stream.next().await {
                    None => Err(LlmError::EmptyStream),
                    Some(Err(e)) => Err(e),
                    Some(Ok(first)) => {
                        let combined = futures::stream::iter([Ok(first)]).chain(stream);
                        Ok(Box::pin(combined) as LlmStream)
                    }
                }
            }
        })
        .await
    }

    /// Produce a complete response through the pool.
    ///
    /// # Errors
    ///
    /// Same contract as [`Llms::stream`].
    pub async fn generate(
        &self,
        keys: &[String],
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<GenerateResult, LlmError> {
        self.with_retries(keys, signal, |provider| {
            let request = request.clone();
            let signal = signal.clone();
            async move { provider.generate(&request, &signal).await }
        })
        .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        keys: &[String],
        signal: &AbortSignal,
        op: F,
    ) -> Result<T, LlmError>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let candidates = self.candidates(keys);
        if candidates.is_empty() {
            return Err(LlmError::PoolExhausted {
                last: format!("no providers configured for keys {keys:?}"),
            });
        }

        let mut last_error = LlmError::EmptyStream;
        for attempt in 0..self.retry.max_attempts {
            if signal.is_aborted() {
                return Err(LlmError::Aborted);
            }
            for provider in &candidates {
                match op(Arc::clone(provider)).await {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_retryable() => {
                        warn!(
                            provider = provider.name(),
                            attempt,
                            error = %err,
                            "Retryable llm failure"
                        );
                        last_error = err;
                    }
                    Err(err) => return Err(err),
                }
            }
            if attempt + 1 < self.retry.max_attempts {
                let delay = self.retry.backoff_delay(attempt as u32);
                debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = signal.cancelled() => return Err(LlmError::Aborted),
                }
            }
        }
        Err(LlmError::PoolExhausted {
            last: last_error.to_string(),
        })
    }
}

impl std::fmt::Debug for Llms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llms")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
