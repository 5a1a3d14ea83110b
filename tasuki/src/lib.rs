#![cfg_attr(docsrs, feature(doc_cfg))]
//! Tasuki is a multi-agent task runtime: it plans a natural-language task
//! into a workflow of cooperating agents, schedules them along their
//! dependency graph, drives each agent through a Reason-Act loop with tool
//! dispatch, replans the unexecuted suffix when partial results invalidate
//! the plan, and streams every step to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tasuki::prelude::*;
//!
//! let config = Config::builder()
//!     .llm("default", Arc::new(OpenAiProvider::builder().model("gpt-4o-mini").build()?))
//!     .agent(Agent::builder("File").description("writes files").tool(file_tool).build())
//!     .build()?;
//!
//! let runtime = TaskRuntime::new(config);
//! let outcome = runtime.run("Write 'hello' to /tmp/a.txt").await?;
//! println!("{}", outcome.result);
//! ```

// Core state and traces
pub mod chain;
pub mod context;
pub mod error;

// Model surface
pub mod llm;
pub mod message;

// Tools
pub mod mcp;
pub mod tool;
pub mod tools;

// Orchestration
pub mod agent;
pub mod callback;
pub mod config;
pub mod planner;
pub mod runtime;
pub mod workflow;

mod scheduler;

pub mod prelude;

// Re-export the types almost every embedder touches.
pub use agent::{Agent, AgentBuilder};
pub use callback::{StreamMessage, StreamPayload, TaskCallback};
pub use config::{Config, ConfigBuilder, FailurePolicy};
pub use error::{LlmError, Result, TaskError, ToolError};
pub use runtime::{TaskHandle, TaskResult, TaskRuntime};
pub use tool::{Tool, ToolResult};
