//! Streaming callback surface.
//!
//! Everything a caller observes during a task run arrives through
//! [`TaskCallback::on_message`] as a stream of [`StreamPayload`] values.
//! Human-in-the-loop hooks live on the same trait so an application wires a
//! single object into the runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::Result;
use crate::llm::{FinishReason, TokenUsage};
use crate::tool::ToolResult;

/// Envelope for every streamed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    /// Discriminator for multiplexed consumer channels; always `"agent"`.
    pub stream_type: String,
    /// The chat this task belongs to.
    pub chat_id: String,
    /// The task id.
    pub task_id: String,
    /// Name of the emitting agent, when agent-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Workflow node the agent is currently on, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
    /// The message body.
    pub message: StreamMessage,
}

impl StreamPayload {
    /// Create a task-scoped payload (no agent attribution).
    #[must_use]
    pub fn task(chat_id: impl Into<String>, task_id: impl Into<String>, message: StreamMessage) -> Self {
        Self {
            stream_type: "agent".to_owned(),
            chat_id: chat_id.into(),
            task_id: task_id.into(),
            agent_name: None,
            node_id: None,
            message,
        }
    }

    /// Attribute the payload to an agent.
    #[must_use]
    pub fn for_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    /// Attach the current workflow node.
    #[must_use]
    pub const fn at_node(mut self, node_id: u32) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// The union of streamed message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamMessage {
    /// The task run has started.
    WorkflowStart,
    /// A (possibly partial) workflow produced by the planner.
    Workflow {
        /// Serialized workflow XML; partial until `stream_done`.
        xml: String,
        /// Whether this is the authoritative final parse.
        stream_done: bool,
    },
    /// Incremental assistant text.
    Text {
        /// Stable id for this text stream within a turn.
        stream_id: String,
        /// The text delta, or the full text when `stream_done`.
        text: String,
        /// Whether the stream is complete.
        stream_done: bool,
    },
    /// Incremental reasoning text.
    Thinking {
        /// Stable id for this reasoning stream within a turn.
        stream_id: String,
        /// The reasoning delta, or the full text when `stream_done`.
        text: String,
        /// Whether the stream is complete.
        stream_done: bool,
    },
    /// Partial tool-call arguments are accumulating.
    ToolStreaming {
        /// Name of the tool being called.
        tool_name: String,
        /// Id of the tool call.
        tool_call_id: String,
        /// The argument text accumulated so far.
        params_text: String,
    },
    /// A tool call is fully resolved and about to run.
    ToolUse {
        /// Name of the tool being called.
        tool_name: String,
        /// Id of the tool call.
        tool_call_id: String,
        /// Resolved arguments.
        params: Value,
    },
    /// Progress reported by a running tool.
    ToolRunning {
        /// Name of the running tool.
        tool_name: String,
        /// Id of the tool call.
        tool_call_id: String,
        /// Tool-defined progress text.
        text: String,
    },
    /// A tool call finished.
    ToolResult {
        /// Name of the tool.
        tool_name: String,
        /// Id of the tool call.
        tool_call_id: String,
        /// The arguments the tool ran with.
        params: Value,
        /// The result.
        result: ToolResult,
    },
    /// An error surfaced during execution.
    Error {
        /// Human-readable error description.
        error: String,
    },
    /// An agent's ReAct loop finished.
    Finish {
        /// Why the final LLM turn stopped.
        finish_reason: FinishReason,
        /// Token usage accumulated by the agent.
        usage: TokenUsage,
        /// Whether the agent succeeded.
        success: bool,
    },
    /// The task run finished.
    WorkflowEnd {
        /// Whether the run succeeded.
        success: bool,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
        /// Token usage accumulated across all agents.
        usage: TokenUsage,
    },
}

/// Caller-provided hooks for streaming output and human interaction.
///
/// All methods have no-op defaults so implementors override only what they
/// need. `on_message` invocations are awaited inline by the emitting agent;
/// implementations that block will slow that agent down.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    /// Receive a streamed message.
    async fn on_message(&self, payload: &StreamPayload) {
        let _ = payload;
    }

    /// Ask the human to confirm an operation. Defaults to approval.
    async fn on_human_confirm(&self, ctx: &AgentContext, prompt: &str) -> Result<bool> {
        let _ = (ctx, prompt);
        Ok(true)
    }

    /// Ask the human for free-form input. Defaults to an empty answer.
    async fn on_human_input(&self, ctx: &AgentContext, prompt: &str) -> Result<String> {
        let _ = (ctx, prompt);
        Ok(String::new())
    }

    /// Ask the human to select among options. Defaults to no selection.
    async fn on_human_select(
        &self,
        ctx: &AgentContext,
        prompt: &str,
        options: &[String],
        multiple: bool,
    ) -> Result<Vec<String>> {
        let _ = (ctx, prompt, options, multiple);
        Ok(Vec::new())
    }
}

/// A callback that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

#[async_trait]
impl TaskCallback for NoopCallback {}
