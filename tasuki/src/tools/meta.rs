//! Schema-only tools for forced meta calls.
//!
//! These tools never do real work: the runtime forces the model to call
//! them (via a pinned tool choice) so its judgment arrives as structured
//! arguments, and the implementations merely echo those arguments back.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{Tool, ToolResult};

/// Progress classification target for the loop-detection meta call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TodoListManagerTool;

#[async_trait]
impl Tool for TodoListManagerTool {
    fn name(&self) -> &str {
        "todo_list_manager"
    }

    fn description(&self) -> String {
        "Classify the task progress: list completed and pending items and \
         report whether the recent turns repeat themselves."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "thinking": {
                    "type": "string",
                    "description": "Brief reasoning about the progress"
                },
                "completed": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Work items already finished"
                },
                "pending": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Work items still open"
                },
                "loop_detected": {
                    "type": "boolean",
                    "description": "True when recent turns repeat without progress"
                }
            },
            "required": ["completed", "pending", "loop_detected"]
        })
    }

    fn no_plan(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: Value,
        _ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::json(&args))
    }
}

/// Replan judgment target for the mid-flight replan check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckTaskStatusTool;

#[async_trait]
impl Tool for CheckTaskStatusTool {
    fn name(&self) -> &str {
        "check_task_status"
    }

    fn description(&self) -> String {
        "Judge whether the remaining plan is still valid given the results \
         so far, and whether the unexecuted suffix should be replanned."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "thinking": {
                    "type": "string",
                    "description": "Brief reasoning about plan validity"
                },
                "replan": {
                    "type": "boolean",
                    "description": "True when the remaining plan should be regenerated"
                }
            },
            "required": ["replan"]
        })
    }

    fn no_plan(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: Value,
        _ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::json(&args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;

    #[tokio::test]
    async fn meta_tools_echo_arguments() {
        let task = test_support::task_context();
        let ctx = test_support::agent_context(&task);
        let args = serde_json::json!({"replan": true, "thinking": "plan is stale"});
        let result = CheckTaskStatusTool
            .execute(
                args.clone(),
                &ctx,
                &ToolUse::new("c1", "check_task_status", Value::Null),
            )
            .await
            .unwrap();
        let echoed: Value =
            serde_json::from_str(result.first_text().unwrap()).unwrap();
        assert_eq!(echoed, args);
    }

    #[test]
    fn meta_tools_are_hidden_from_planning() {
        assert!(TodoListManagerTool.no_plan());
        assert!(CheckTaskStatusTool.no_plan());
    }
}
