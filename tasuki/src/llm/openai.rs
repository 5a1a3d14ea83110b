//! OpenAI-compatible chat-completions provider.
//!
//! Works against the official API and any compatible gateway via a
//! `base_url` override. Streaming responses are parsed from SSE by hand;
//! tool-call fragments are assembled per index and re-emitted as complete
//! [`StreamChunk::ToolCall`] events before the terminal finish chunk.

use std::collections::BTreeMap;

use async_stream::stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{FinishReason, GenerateResult, LlmRequest, LlmStream, StreamChunk, TokenUsage, ToolChoice};
use crate::context::AbortSignal;
use crate::error::{LlmError, TaskError};
use crate::message::{LlmMessage, MessagePart, Role, ToolUse};

/// Default OpenAI API base URL.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible provider.
///
/// # Example
///
/// ```rust,ignore
/// let provider = OpenAiProvider::builder()
///     .model("gpt-4o-mini")
///     .api_key("sk-...")
///     .base_url("https://my-gateway.example.com/v1")
///     .build()?;
/// ```
#[derive(Clone)]
pub struct OpenAiProvider {
    model: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenAiProvider {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> OpenAiProviderBuilder {
        OpenAiProviderBuilder::default()
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &LlmRequest, streaming: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages_to_json(&request.messages),
        });
        let obj = body.as_object_mut().unwrap_or_else(|| unreachable!());
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), Value::Array(tools));
            let choice = match &request.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Tool(name) => json!({
                    "type": "function",
                    "function": { "name": name }
                }),
            };
            obj.insert("tool_choice".into(), choice);
        }
        if let Some(temperature) = request.temperature {
            obj.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            obj.insert("top_p".into(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            obj.insert("max_tokens".into(), json!(max_tokens));
        }
        if !request.stop_sequences.is_empty() {
            obj.insert("stop".into(), json!(request.stop_sequences));
        }
        if streaming {
            obj.insert("stream".into(), json!(true));
            obj.insert("stream_options".into(), json!({"include_usage": true}));
        }
        body
    }

    async fn send(&self, body: &Value, signal: &AbortSignal) -> Result<reqwest::Response, LlmError> {
        let request = self
            .http
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(body);
        let response = tokio::select! {
            result = request.send() => result.map_err(|e| LlmError::Network(e.to_string()))?,
            () = signal.cancelled() => return Err(LlmError::Aborted),
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), body));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl super::LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<LlmStream, LlmError> {
        let body = self.build_body(request, true);
        let response = self.send(&body, signal).await?;
        let mut bytes = response.bytes_stream();
        let signal = signal.clone();

        let chunks = stream! {
            let mut parser = SseParser::default();
            let mut assembler = ToolCallAssembler::default();
            let mut finish_reason: Option<FinishReason> = None;
            let mut usage = TokenUsage::default();

            'read: loop {
                let item = tokio::select! {
                    item = bytes.next() => item,
                    () = signal.cancelled() => {
                        yield Err(LlmError::Aborted);
                        return;
                    }
                };
                let Some(item) = item else { break 'read };
                let data = match item {
                    Ok(data) => data,
                    Err(e) => {
                        yield Err(LlmError::Stream(e.to_string()));
                        return;
                    }
                };
                let Ok(text) = std::str::from_utf8(&data) else {
                    continue;
                };
                for payload in parser.feed(text) {
                    if payload == "[DONE]" {
                        break 'read;
                    }
                    match serde_json::from_str::<ApiStreamChunk>(&payload) {
                        Ok(chunk) => {
                            if let Some(api_usage) = chunk.usage {
                                usage = api_usage.into();
                            }
                            for choice in chunk.choices {
                                if let Some(reason) = choice.finish_reason.as_deref() {
                                    finish_reason = Some(FinishReason::from_provider(reason));
                                }
                                if let Some(text) = choice.delta.reasoning_content
                                    && !text.is_empty()
                                {
                                    yield Ok(StreamChunk::ReasoningDelta { text });
                                }
                                if let Some(text) = choice.delta.content
                                    && !text.is_empty()
                                {
                                    yield Ok(StreamChunk::TextDelta { text });
                                }
                                for delta in choice.delta.tool_calls.unwrap_or_default() {
                                    if let Some(event) = assembler.apply(&delta) {
                                        yield Ok(event);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(LlmError::Parse(e.to_string()));
                            return;
                        }
                    }
                }
            }

            let calls = assembler.finish();
            let has_calls = !calls.is_empty();
            for call in calls {
                yield Ok(StreamChunk::ToolCall(call));
            }
            let reason = finish_reason.unwrap_or(if has_calls {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            });
            yield Ok(StreamChunk::Finish { reason, usage });
        };

        Ok(Box::pin(chunks))
    }

    async fn generate(
        &self,
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<GenerateResult, LlmError> {
        let body = self.build_body(request, false);
        let response = self.send(&body, signal).await?;
        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("response has no choices".to_owned()))?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.reasoning_content
            && !text.is_empty()
        {
            content.push(MessagePart::Thinking { text });
        }
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(MessagePart::text(text));
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            content.push(MessagePart::ToolUse(ToolUse::new(
                call.id,
                call.function.name,
                parse_args(&call.function.arguments),
            )));
        }

        let finish_reason = choice
            .finish_reason
            .as_deref()
            .map_or(FinishReason::Stop, FinishReason::from_provider);
        Ok(GenerateResult {
            content,
            finish_reason,
            usage: parsed.usage.map(Into::into).unwrap_or_default(),
        })
    }
}

/// Builder for [`OpenAiProvider`].
#[derive(Default)]
pub struct OpenAiProviderBuilder {
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl std::fmt::Debug for OpenAiProviderBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProviderBuilder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiProviderBuilder {
    /// Set the model identifier (required).
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the API key; defaults to the `OPENAI_API_KEY` env var.
    #[must_use]
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set a custom base URL for compatible gateways.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the request timeout in seconds.
    #[must_use]
    pub const fn timeout_secs(mut self, timeout: u64) -> Self {
        self.timeout_secs = Some(timeout);
        self
    }

    /// Build the provider.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] when the model is missing, no API key
    /// is available, or the HTTP client cannot be constructed.
    pub fn build(self) -> Result<OpenAiProvider, TaskError> {
        let model = self
            .model
            .ok_or_else(|| TaskError::config("openai provider requires a model"))?;
        let api_key = match self.api_key {
            Some(key) => key,
            None => std::env::var("OPENAI_API_KEY")
                .map_err(|_| TaskError::config("no api key and OPENAI_API_KEY is not set"))?,
        };
        let mut client = reqwest::Client::builder();
        if let Some(timeout) = self.timeout_secs {
            client = client.timeout(std::time::Duration::from_secs(timeout));
        }
        let http = client
            .build()
            .map_err(|e| TaskError::config(format!("http client: {e}")))?;
        Ok(OpenAiProvider {
            model,
            api_key,
            base_url: self
                .base_url
                .unwrap_or_else(|| OPENAI_API_BASE_URL.to_owned()),
            http,
        })
    }
}

fn map_status(status: u16, body: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Auth {
            provider: "openai".to_owned(),
            message: body,
        },
        429 => LlmError::Quota {
            provider: "openai".to_owned(),
            message: body,
        },
        _ => LlmError::HttpStatus { status, body },
    }
}

fn parse_args(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn messages_to_json(messages: &[LlmMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => out.push(json!({
                "role": "system",
                "content": message.text_content(),
            })),
            Role::User => out.push(user_to_json(message)),
            Role::Assistant => out.push(assistant_to_json(message)),
            // One API message per tool result, matched by call id.
            Role::Tool => {
                for part in &message.content {
                    if let MessagePart::ToolOutput {
                        tool_call_id,
                        result,
                        ..
                    } = part
                    {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": result.render(),
                        }));
                    }
                }
            }
        }
    }
    out
}

fn user_to_json(message: &LlmMessage) -> Value {
    let has_images = message
        .content
        .iter()
        .any(|p| matches!(p, MessagePart::Image { .. }));
    if !has_images {
        return json!({"role": "user", "content": message.text_content()});
    }
    let parts: Vec<Value> = message
        .content
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(json!({"type": "text", "text": text})),
            MessagePart::Image { data, mime_type } => Some(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{mime_type};base64,{data}")}
            })),
            _ => None,
        })
        .collect();
    json!({"role": "user", "content": parts})
}

fn assistant_to_json(message: &LlmMessage) -> Value {
    let text = message.text_content();
    let calls: Vec<Value> = message
        .tool_uses()
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments_string(),
                }
            })
        })
        .collect();
    let mut msg = json!({"role": "assistant"});
    let obj = msg.as_object_mut().unwrap_or_else(|| unreachable!());
    if text.is_empty() {
        obj.insert("content".into(), Value::Null);
    } else {
        obj.insert("content".into(), json!(text));
    }
    if !calls.is_empty() {
        obj.insert("tool_calls".into(), Value::Array(calls));
    }
    msg
}

/// Incremental SSE line parser.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Feed raw text, returning completed `data:` payloads.
    fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(payload) = Self::parse_line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn parse_line(line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }
        trimmed.strip_prefix("data:").map(|d| d.trim().to_owned())
    }
}

/// Assembles tool calls from per-index argument fragments.
#[derive(Debug, Default)]
struct ToolCallAssembler {
    pending: BTreeMap<usize, PendingCall>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    /// Apply a delta, returning a `ToolCallDelta` event when it carries
    /// argument text.
    fn apply(&mut self, delta: &ApiToolCallDelta) -> Option<StreamChunk> {
        let index = delta.index.unwrap_or(0);
        let entry = self.pending.entry(index).or_default();
        if let Some(id) = &delta.id
            && !id.is_empty()
        {
            entry.id.clone_from(id);
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name
                && !name.is_empty()
            {
                entry.name.clone_from(name);
            }
            if let Some(args) = &function.arguments
                && !args.is_empty()
            {
                entry.arguments.push_str(args);
                return Some(StreamChunk::ToolCallDelta {
                    tool_call_id: entry.id.clone(),
                    tool_name: entry.name.clone(),
                    args_delta: args.clone(),
                });
            }
        }
        None
    }

    /// Drain assembled calls in index order.
    fn finish(self) -> Vec<ToolUse> {
        self.pending
            .into_values()
            .filter(|call| !call.name.is_empty())
            .enumerate()
            .map(|(i, call)| {
                let id = if call.id.is_empty() {
                    format!("call_{i}")
                } else {
                    call.id
                };
                ToolUse::new(id, call.name, parse_args(&call.arguments))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    delta: ApiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ApiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<ApiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct ApiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<ApiUsage> for TokenUsage {
    fn from(usage: ApiUsage) -> Self {
        Self::new(usage.prompt_tokens, usage.completion_tokens)
    }
}
