//! Convenience re-exports for embedders.
//!
//! ```rust,ignore
//! use tasuki::prelude::*;
//! ```

pub use crate::agent::{Agent, AgentBuilder};
pub use crate::callback::{NoopCallback, StreamMessage, StreamPayload, TaskCallback};
pub use crate::chain::{AgentChain, TaskChain, ToolChain};
pub use crate::config::{Config, ConfigBuilder, FailurePolicy, RetryPolicy};
pub use crate::context::{AbortSignal, AgentContext, TaskContext};
pub use crate::error::{LlmError, Result, TaskError, ToolError};
pub use crate::llm::{
    FinishReason, GenerateResult, LlmDescriptor, LlmProvider, LlmRequest, MockProvider,
    OpenAiProvider, StreamChunk, TokenUsage, ToolChoice,
};
pub use crate::mcp::{McpCallToolParams, McpListToolsParams, McpService, McpToolDecl};
pub use crate::message::{LlmMessage, MessagePart, Role, ToolUse};
pub use crate::runtime::{TaskHandle, TaskResult, TaskRuntime};
pub use crate::tool::{Tool, ToolDefinition, ToolPart, ToolRegistry, ToolResult};
pub use crate::workflow::{NodeKind, NodeStatus, Workflow, WorkflowAgent, WorkflowNode};
