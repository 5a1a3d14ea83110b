//! Iteration counter for forEach workflow nodes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{Tool, ToolResult};

/// Walks a forEach node's item list one element per call.
///
/// The cursor lives in agent-scoped variables keyed by node id, so several
/// forEach sections in one agent keep independent positions. Items are
/// either an inline array or the name of a task variable holding one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForeachTaskTool;

#[derive(Debug, Deserialize)]
struct ForeachArgs {
    node_id: u32,
    #[serde(default)]
    action: ForeachAction,
    #[serde(default)]
    items: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ForeachAction {
    #[default]
    Next,
    Reset,
}

fn cursor_key(node_id: u32) -> String {
    format!("__foreach_cursor_{node_id}")
}

fn resolve_items(ctx: &AgentContext, items: Option<Value>) -> Result<Vec<Value>, ToolError> {
    let value = match items {
        Some(Value::Array(list)) => return Ok(list),
        Some(Value::String(name)) => ctx.task().get_variable(&name).ok_or_else(|| {
            ToolError::InvalidArguments(format!("variable '{name}' is not set"))
        })?,
        Some(other) => other,
        None => {
            return Err(ToolError::InvalidArguments(
                "'items' is required: an array or a variable name".into(),
            ));
        }
    };
    match value {
        Value::Array(list) => Ok(list),
        other => Ok(vec![other]),
    }
}

#[async_trait]
impl Tool for ForeachTaskTool {
    fn name(&self) -> &str {
        "foreach_task"
    }

    fn description(&self) -> String {
        "Iterate over the items of a forEach node. Call with action 'next' \
         to receive the next item; the tool reports 'done' when the list is \
         exhausted. 'reset' restarts the iteration."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "node_id": {
                    "type": "integer",
                    "description": "Id of the forEach node being iterated"
                },
                "action": {
                    "type": "string",
                    "enum": ["next", "reset"],
                    "description": "Advance the cursor or restart"
                },
                "items": {
                    "description": "The item array, or the name of a task variable holding it"
                }
            },
            "required": ["node_id", "items"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        let args: ForeachArgs = serde_json::from_value(args)?;
        let key = cursor_key(args.node_id);

        match args.action {
            ForeachAction::Reset => {
                ctx.set_variable(&key, Value::from(0));
                Ok(ToolResult::text("Iteration reset"))
            }
            ForeachAction::Next => {
                let items = resolve_items(ctx, args.items)?;
                let cursor = ctx
                    .get_variable(&key)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                if cursor >= items.len() {
                    return Ok(ToolResult::text(format!(
                        "done: all {} items processed",
                        items.len()
                    )));
                }
                ctx.set_variable(&key, Value::from(cursor as u64 + 1));
                let item = &items[cursor];
                Ok(ToolResult::text(format!(
                    "item {} of {}: {}",
                    cursor + 1,
                    items.len(),
                    serde_json::to_string(item).unwrap_or_else(|_| item.to_string())
                )))
            }
        }
    }
}
