//! Human-in-the-loop interaction tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{Tool, ToolResult};

/// Suspends the agent to ask the human for confirmation, input or a
/// selection through the caller's callback hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct HumanInteractTool;

#[derive(Debug, Deserialize)]
struct HumanInteractArgs {
    interact_type: InteractType,
    prompt: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    multiple: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum InteractType {
    Confirm,
    Input,
    Select,
}

#[async_trait]
impl Tool for HumanInteractTool {
    fn name(&self) -> &str {
        "human_interact"
    }

    fn description(&self) -> String {
        "Ask the human operator for confirmation, free-form input, or a \
         selection among options. Use before destructive or ambiguous steps."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "interact_type": {
                    "type": "string",
                    "enum": ["confirm", "input", "select"],
                    "description": "The kind of interaction"
                },
                "prompt": {
                    "type": "string",
                    "description": "What to ask the human"
                },
                "options": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Choices for 'select'"
                },
                "multiple": {
                    "type": "boolean",
                    "description": "Allow multiple selections"
                }
            },
            "required": ["interact_type", "prompt"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        let args: HumanInteractArgs = serde_json::from_value(args)?;
        let callback = ctx.task().config().callback.clone();
        match args.interact_type {
            InteractType::Confirm => {
                let approved = callback
                    .on_human_confirm(ctx, &args.prompt)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                if approved {
                    Ok(ToolResult::text("The user confirmed the operation"))
                } else {
                    Ok(ToolResult::text(
                        "The user declined the operation; adjust the plan accordingly",
                    ))
                }
            }
            InteractType::Input => {
                let input = callback
                    .on_human_input(ctx, &args.prompt)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                if input.is_empty() {
                    Ok(ToolResult::text("The user provided no input"))
                } else {
                    Ok(ToolResult::text(format!("The user answered: {input}")))
                }
            }
            InteractType::Select => {
                if args.options.is_empty() {
                    return Err(ToolError::InvalidArguments(
                        "'select' requires non-empty options".into(),
                    ));
                }
                let selected = callback
                    .on_human_select(ctx, &args.prompt, &args.options, args.multiple)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                if selected.is_empty() {
                    Ok(ToolResult::text("The user selected nothing"))
                } else {
                    Ok(ToolResult::text(format!(
                        "The user selected: {}",
                        selected.join(", ")
                    )))
                }
            }
        }
    }
}
