//! Scripted mock provider for deterministic tests.
//!
//! The mock replays predefined turns in order: each `stream` call pops the
//! next turn and yields its chunks. When the script is exhausted it returns
//! a plain "Done." text turn so open-ended loops terminate.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{FinishReason, LlmRequest, LlmStream, StreamChunk, TokenUsage};
use crate::context::AbortSignal;
use crate::error::LlmError;
use crate::message::ToolUse;

/// One scripted turn.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Yield these chunks as a successful stream.
    Chunks(Vec<StreamChunk>),
    /// Fail the call with this error.
    Error(LlmError),
}

/// A scripted LLM provider for tests.
pub struct MockProvider {
    name: String,
    turns: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<LlmRequest>>,
    call_seq: AtomicUsize,
    delay: Option<Duration>,
}

impl MockProvider {
    /// Create an unscripted mock named "mock".
    #[must_use]
    pub fn new() -> Self {
        Self::named("mock")
    }

    /// Create an unscripted mock with a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            turns: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            call_seq: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep this long before answering each call; lets abort tests race
    /// the signal against an in-flight request.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Script a raw turn.
    pub fn push_turn(&self, turn: MockTurn) {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(turn);
    }

    /// Script a text-only turn (ends with `FinishReason::Stop`).
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_turn(MockTurn::Chunks(vec![
            StreamChunk::TextDelta { text: text.into() },
            StreamChunk::Finish {
                reason: FinishReason::Stop,
                usage: TokenUsage::new(10, 5),
            },
        ]));
    }

    /// Script a turn that streams the text in several deltas.
    pub fn push_text_deltas(&self, deltas: &[&str]) {
        let mut chunks: Vec<StreamChunk> = deltas
            .iter()
            .map(|d| StreamChunk::TextDelta {
                text: (*d).to_owned(),
            })
            .collect();
        chunks.push(StreamChunk::Finish {
            reason: FinishReason::Stop,
            usage: TokenUsage::new(10, 5),
        });
        self.push_turn(MockTurn::Chunks(chunks));
    }

    /// Script a turn calling one tool.
    pub fn push_tool_call(&self, tool_name: &str, args: Value) {
        self.push_tool_calls(&[(tool_name, args)]);
    }

    /// Script a turn calling several tools in order.
    pub fn push_tool_calls(&self, calls: &[(&str, Value)]) {
        let mut chunks = Vec::new();
        for (tool_name, args) in calls {
            let id = format!("call_{}", self.call_seq.fetch_add(1, Ordering::SeqCst));
            chunks.push(StreamChunk::ToolCallDelta {
                tool_call_id: id.clone(),
                tool_name: (*tool_name).to_owned(),
                args_delta: args.to_string(),
            });
            chunks.push(StreamChunk::ToolCall(ToolUse::new(
                id,
                *tool_name,
                args.clone(),
            )));
        }
        chunks.push(StreamChunk::Finish {
            reason: FinishReason::ToolCalls,
            usage: TokenUsage::new(10, 5),
        });
        self.push_turn(MockTurn::Chunks(chunks));
    }

    /// Script a failing call.
    pub fn push_error(&self, error: LlmError) {
        self.push_turn(MockTurn::Error(error));
    }

    /// Requests observed so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of calls answered so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn next_turn(&self) -> MockTurn {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                MockTurn::Chunks(vec![
                    StreamChunk::TextDelta {
                        text: "Done.".to_owned(),
                    },
                    StreamChunk::Finish {
                        reason: FinishReason::Stop,
                        usage: TokenUsage::new(1, 1),
                    },
                ])
            })
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("name", &self.name)
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl super::LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        signal: &AbortSignal,
    ) -> Result<LlmStream, LlmError> {
        if signal.is_aborted() {
            return Err(LlmError::Aborted);
        }
        if let Some(delay) = self.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = signal.cancelled() => return Err(LlmError::Aborted),
            }
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match self.next_turn() {
            MockTurn::Error(err) => Err(err),
            MockTurn::Chunks(chunks) => {
                Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::LlmProvider;
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn replays_turns_in_order() {
        let provider = MockProvider::new();
        provider.push_text("first");
        provider.push_tool_call("echo", serde_json::json!({"message": "hi"}));

        let request = LlmRequest::new(vec![]);
        let signal = AbortSignal::new();

        let first = provider.generate(&request, &signal).await.unwrap();
        assert_eq!(first.text(), "first");
        assert_eq!(first.finish_reason, FinishReason::Stop);

        let second = provider.generate(&request, &signal).await.unwrap();
        assert_eq!(second.tool_uses().len(), 1);
        assert_eq!(second.tool_uses()[0].name, "echo");
        assert_eq!(second.finish_reason, FinishReason::ToolCalls);
    }

    #[tokio::test]
    async fn exhausted_script_yields_done() {
        let provider = MockProvider::new();
        let result = provider
            .generate(&LlmRequest::new(vec![]), &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(result.text(), "Done.");
    }

    #[tokio::test]
    async fn records_requests() {
        let provider = MockProvider::new();
        provider.push_text("x");
        let request = LlmRequest::new(vec![crate::message::LlmMessage::user("probe")]);
        let _ = provider.stream(&request, &AbortSignal::new()).await.unwrap();
        let seen = provider.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].text_content(), "probe");
    }

    #[tokio::test]
    async fn delayed_call_observes_abort() {
        let provider = MockProvider::new().with_delay(Duration::from_secs(10));
        provider.push_text("never");
        let signal = AbortSignal::new();
        let aborter = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            aborter.abort(None);
        });
        let result = provider.stream(&LlmRequest::new(vec![]), &signal).await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, LlmError::Aborted));
    }

    #[tokio::test]
    async fn multiple_tool_calls_keep_order() {
        let provider = MockProvider::new();
        provider.push_tool_calls(&[
            ("first", serde_json::json!({})),
            ("second", serde_json::json!({})),
        ]);
        let result = provider
            .generate(&LlmRequest::new(vec![]), &AbortSignal::new())
            .await
            .unwrap();
        let names: Vec<_> = result.tool_uses().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["first", "second"]);
        let mut stream = provider
            .stream(&LlmRequest::new(vec![]), &AbortSignal::new())
            .await
            .unwrap();
        // Exhausted script: default turn.
        let chunk = stream.next().await.unwrap().unwrap();
        assert!(matches!(chunk, StreamChunk::TextDelta { .. }));
    }
}
