//! Cross-agent variable storage tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{Tool, ToolResult};

/// Reads and writes the task-scoped variable map.
///
/// Listed in the default serial-tool set so read-modify-write sequences
/// within one turn are never interleaved with other calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableStorageTool;

#[derive(Debug, Deserialize)]
struct VariableStorageArgs {
    action: VariableAction,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum VariableAction {
    Get,
    Set,
    List,
}

#[async_trait]
impl Tool for VariableStorageTool {
    fn name(&self) -> &str {
        "variable_storage"
    }

    fn description(&self) -> String {
        "Read and write task variables shared across agents. \
         Use 'set' to publish a value for later agents, 'get' to read one, \
         'list' to see all variable names."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["get", "set", "list"],
                    "description": "The operation to perform"
                },
                "key": {
                    "type": "string",
                    "description": "Variable name (required for get/set)"
                },
                "value": {
                    "description": "Value to store (required for set)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        let args: VariableStorageArgs = serde_json::from_value(args)?;
        match args.action {
            VariableAction::Get => {
                let key = args
                    .key
                    .ok_or_else(|| ToolError::InvalidArguments("'get' requires a key".into()))?;
                match ctx.task().get_variable(&key) {
                    Some(value) => Ok(ToolResult::json(&value)),
                    None => Ok(ToolResult::text(format!("Variable '{key}' is not set"))),
                }
            }
            VariableAction::Set => {
                let key = args
                    .key
                    .ok_or_else(|| ToolError::InvalidArguments("'set' requires a key".into()))?;
                let value = args
                    .value
                    .ok_or_else(|| ToolError::InvalidArguments("'set' requires a value".into()))?;
                ctx.task().set_variable(&key, value);
                Ok(ToolResult::text(format!("Stored variable '{key}'")))
            }
            VariableAction::List => {
                let mut names: Vec<String> = ctx.task().variables().into_keys().collect();
                names.sort();
                if names.is_empty() {
                    Ok(ToolResult::text("No variables are set"))
                } else {
                    Ok(ToolResult::text(names.join(", ")))
                }
            }
        }
    }
}
