//! Error types for the tasuki runtime.
//!
//! Three error enums cover the three failure domains: [`LlmError`] for
//! provider communication, [`ToolError`] for tool resolution and execution,
//! and [`TaskError`] for everything that surfaces out of a task run.
//! Tool errors never escape a ReAct turn; they are converted into
//! `ToolResult { is_error: true }` at the dispatch boundary.

use thiserror::Error;

/// A type alias for `Result<T, TaskError>`.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Error type for LLM provider operations.
///
/// Each variant represents a distinct failure mode, enabling the adapter to
/// pattern-match on specific cases when deciding whether to retry.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum LlmError {
    /// Authentication or authorization failure.
    #[error("[{provider}] auth failure: {message}")]
    Auth {
        /// Provider name (e.g., "openai").
        provider: String,
        /// Error description.
        message: String,
    },

    /// Quota or rate limit exhausted.
    #[error("[{provider}] quota exhausted: {message}")]
    Quota {
        /// Provider name.
        provider: String,
        /// Error description.
        message: String,
    },

    /// The provider ended the response with a content-filter finish reason.
    #[error("response stopped by content filter")]
    ContentFiltered,

    /// Network or connection error.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Error while reading a streaming response.
    #[error("stream error: {0}")]
    Stream(String),

    /// The stream completed without producing any content.
    #[error("provider returned an empty stream")]
    EmptyStream,

    /// The response could not be parsed.
    #[error("response parse error: {0}")]
    Parse(String),

    /// The request was aborted through the task signal.
    #[error("request aborted")]
    Aborted,

    /// Provider-specific hard error.
    #[error("[{provider}] {message}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Error description.
        message: String,
    },

    /// All providers in the pool failed.
    #[error("all providers exhausted: {last}")]
    PoolExhausted {
        /// The last error observed.
        last: String,
    },
}

impl LlmError {
    /// Whether the adapter is allowed to retry after this error.
    ///
    /// Network failures, 5xx statuses, stream/parse failures and empty
    /// streams are transient. Aborts, content-filter stops, auth failures
    /// and quota exhaustion are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Stream(_) | Self::EmptyStream | Self::Parse(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Auth { .. }
            | Self::Quota { .. }
            | Self::ContentFiltered
            | Self::Aborted
            | Self::Provider { .. }
            | Self::PoolExhausted { .. } => false,
        }
    }
}

/// Error type for tool resolution and execution.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool with the requested name exists in the agent's toolset.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The tool-call arguments could not be parsed against the schema.
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// The tool failed during execution.
    #[error("tool execution failed: {0}")]
    Execution(String),

    /// The execution was interrupted by the task abort signal.
    #[error("tool execution interrupted")]
    Aborted,

    /// A human reviewer denied the operation.
    #[error("operation denied: {0}")]
    Denied(String),
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

/// The top-level error type for task runs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The task-level abort controller fired.
    #[error("task aborted{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted {
        /// Optional reason supplied to `abort`.
        reason: Option<String>,
    },

    /// The planner could not produce a workflow after its retries.
    #[error("planning failed: {0}")]
    PlanFailed(String),

    /// Workflow XML could not be parsed at stream end.
    #[error("malformed workflow: {0}")]
    WorkflowMalformed(String),

    /// The workflow dependency graph contains a cycle.
    #[error("dependency cycle involving agent '{0}'")]
    DependencyCycle(String),

    /// A ReAct loop terminated after too many all-error turns.
    #[error("agent '{agent}' failed after {count} consecutive error turns")]
    ConsecutiveErrors {
        /// The failing agent's name.
        agent: String,
        /// The consecutive-error count at termination.
        count: u32,
    },

    /// The ReAct loop reached its turn cap without terminating.
    #[error("agent '{agent}' reached the maximum of {turns} turns")]
    MaxTurns {
        /// The agent's name.
        agent: String,
        /// The configured turn cap.
        turns: usize,
    },

    /// No registered agent matches the requested name.
    #[error("unknown agent: {0}")]
    AgentNotFound(String),

    /// Error from the LLM adapter.
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    /// Invalid runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaskError {
    /// Create an [`TaskError::Aborted`] without a reason.
    #[must_use]
    pub const fn aborted() -> Self {
        Self::Aborted { reason: None }
    }

    /// Create an [`TaskError::Aborted`] with a reason.
    #[must_use]
    pub fn aborted_with(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: Some(reason.into()),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is an abort.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. }) || matches!(self, Self::Llm(LlmError::Aborted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(LlmError::Network("reset".into()).is_retryable());
        assert!(LlmError::EmptyStream.is_retryable());
        assert!(LlmError::Parse("bad json".into()).is_retryable());
        assert!(
            LlmError::HttpStatus {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::HttpStatus {
                status: 401,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!LlmError::ContentFiltered.is_retryable());
        assert!(!LlmError::Aborted.is_retryable());
        assert!(
            !LlmError::Auth {
                provider: "openai".into(),
                message: "bad key".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn aborted_display() {
        let plain = TaskError::aborted();
        assert_eq!(plain.to_string(), "task aborted");
        let with_reason = TaskError::aborted_with("user request");
        assert_eq!(with_reason.to_string(), "task aborted: user request");
        assert!(with_reason.is_aborted());
    }

    #[test]
    fn tool_error_from_json() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let tool_err = ToolError::from(err);
        assert!(matches!(tool_err, ToolError::InvalidArguments(_)));
    }
}
