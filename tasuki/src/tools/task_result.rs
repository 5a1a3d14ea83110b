//! Explicit result capture tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{Tool, ToolResult};

/// Agent variable the captured result is stored under.
pub const TASK_RESULT_VARIABLE: &str = "__task_result";

/// Lets the agent record its final deliverable explicitly instead of
/// relying on the closing assistant text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskResultTool;

#[derive(Debug, Deserialize)]
struct TaskResultArgs {
    result: String,
}

#[async_trait]
impl Tool for TaskResultTool {
    fn name(&self) -> &str {
        "task_result"
    }

    fn description(&self) -> String {
        "Record the final result of your task. Call this once, when the \
         work is complete, with the full deliverable text."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The complete task result"
                }
            },
            "required": ["result"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        let args: TaskResultArgs = serde_json::from_value(args)?;
        ctx.set_variable(TASK_RESULT_VARIABLE, Value::String(args.result));
        Ok(ToolResult::text("Result recorded"))
    }
}
