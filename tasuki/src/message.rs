//! Message types for agent-model communication.
//!
//! Conversations are sequences of [`LlmMessage`] values, each holding an
//! ordered list of [`MessagePart`]s. Assistant messages mix text and
//! tool-use parts; tool messages carry the matching ordered results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::tool::ToolResult;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool results message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    /// Unique identifier for the tool call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as emitted by the provider: a structured map or a JSON
    /// string, depending on the provider.
    pub arguments: Value,
}

impl ToolUse {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Resolve the arguments into a structured JSON value.
    ///
    /// Providers disagree on whether tool arguments arrive as a JSON string
    /// or as a structured map; both are accepted. An empty or blank string
    /// resolves to an empty object.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidArguments`] when the value is a string
    /// that does not parse as JSON.
    pub fn resolved_arguments(&self) -> Result<Value, ToolError> {
        match &self.arguments {
            Value::String(s) if s.trim().is_empty() => Ok(Value::Object(serde_json::Map::new())),
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| ToolError::InvalidArguments(format!("{e} in {s:?}"))),
            Value::Null => Ok(Value::Object(serde_json::Map::new())),
            other => Ok(other.clone()),
        }
    }

    /// Parse the arguments into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidArguments`] when the arguments do not
    /// match the target type.
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ToolError> {
        let value = self.resolved_arguments()?;
        serde_json::from_value(value).map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }

    /// Get the arguments as a compact JSON string.
    #[must_use]
    pub fn arguments_string(&self) -> String {
        match &self.arguments {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// One part of a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Model reasoning text, kept separate from the answer text.
    Thinking {
        /// The reasoning content.
        text: String,
    },
    /// Inline image content.
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type (e.g., "image/png").
        mime_type: String,
    },
    /// A tool call requested by the model.
    ToolUse(ToolUse),
    /// The result of one tool call, matched by id.
    ToolOutput {
        /// Id of the originating tool call.
        tool_call_id: String,
        /// Name of the tool that produced the result.
        tool_name: String,
        /// The tool result.
        result: ToolResult,
    },
}

impl MessagePart {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get the text if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A chat message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Ordered message body parts.
    pub content: Vec<MessagePart>,
}

impl LlmMessage {
    /// Create a new system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![MessagePart::text(content)],
        }
    }

    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![MessagePart::text(content)],
        }
    }

    /// Create a new assistant message with plain text.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![MessagePart::text(content)],
        }
    }

    /// Create an assistant message from pre-built parts.
    #[must_use]
    pub const fn assistant_parts(content: Vec<MessagePart>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Create a tool message carrying ordered results.
    #[must_use]
    pub fn tool_results(results: Vec<(ToolUse, ToolResult)>) -> Self {
        let content = results
            .into_iter()
            .map(|(call, result)| MessagePart::ToolOutput {
                tool_call_id: call.id,
                tool_name: call.name,
                result,
            })
            .collect();
        Self {
            role: Role::Tool,
            content,
        }
    }

    /// Concatenated text content of the message.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(MessagePart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool calls contained in the message, in emission order.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        self.content
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolUse(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Whether the message contains at least one tool call.
    #[must_use]
    pub fn has_tool_uses(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, MessagePart::ToolUse(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod tool_use {
        use super::*;

        #[test]
        fn resolves_structured_arguments() {
            let call = ToolUse::new("c1", "echo", serde_json::json!({"message": "hi"}));
            let args = call.resolved_arguments().unwrap();
            assert_eq!(args["message"], "hi");
        }

        #[test]
        fn resolves_string_arguments() {
            let call = ToolUse::new("c1", "echo", Value::String(r#"{"message":"hi"}"#.into()));
            let args = call.resolved_arguments().unwrap();
            assert_eq!(args["message"], "hi");
        }

        #[test]
        fn empty_string_becomes_empty_object() {
            let call = ToolUse::new("c1", "noop", Value::String("  ".into()));
            let args = call.resolved_arguments().unwrap();
            assert_eq!(args, serde_json::json!({}));
        }

        #[test]
        fn null_becomes_empty_object() {
            let call = ToolUse::new("c1", "noop", Value::Null);
            assert_eq!(call.resolved_arguments().unwrap(), serde_json::json!({}));
        }

        #[test]
        fn rejects_unparseable_string() {
            let call = ToolUse::new("c1", "echo", Value::String("{not json".into()));
            assert!(matches!(
                call.resolved_arguments(),
                Err(ToolError::InvalidArguments(_))
            ));
        }

        #[test]
        fn parses_typed_arguments() {
            #[derive(Deserialize)]
            struct Args {
                message: String,
            }
            let call = ToolUse::new("c1", "echo", serde_json::json!({"message": "hi"}));
            let args: Args = call.parse_arguments().unwrap();
            assert_eq!(args.message, "hi");
        }
    }

    mod llm_message {
        use super::*;

        #[test]
        fn constructors_set_roles() {
            assert_eq!(LlmMessage::system("s").role, Role::System);
            assert_eq!(LlmMessage::user("u").role, Role::User);
            assert_eq!(LlmMessage::assistant("a").role, Role::Assistant);
        }

        #[test]
        fn text_content_joins_text_parts() {
            let msg = LlmMessage::assistant_parts(vec![
                MessagePart::text("one"),
                MessagePart::ToolUse(ToolUse::new("c1", "t", Value::Null)),
                MessagePart::text("two"),
            ]);
            assert_eq!(msg.text_content(), "one\ntwo");
        }

        #[test]
        fn tool_uses_preserve_order() {
            let msg = LlmMessage::assistant_parts(vec![
                MessagePart::ToolUse(ToolUse::new("c1", "a", Value::Null)),
                MessagePart::ToolUse(ToolUse::new("c2", "b", Value::Null)),
            ]);
            let names: Vec<_> = msg.tool_uses().iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["a", "b"]);
            assert!(msg.has_tool_uses());
        }

        #[test]
        fn tool_results_message_keeps_order() {
            let msg = LlmMessage::tool_results(vec![
                (
                    ToolUse::new("c1", "first", Value::Null),
                    ToolResult::text("r1"),
                ),
                (
                    ToolUse::new("c2", "second", Value::Null),
                    ToolResult::text("r2"),
                ),
            ]);
            assert_eq!(msg.role, Role::Tool);
            let ids: Vec<_> = msg
                .content
                .iter()
                .filter_map(|p| match p {
                    MessagePart::ToolOutput { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(ids, vec!["c1", "c2"]);
        }

        #[test]
        fn serde_round_trip() {
            let msg = LlmMessage::assistant_parts(vec![
                MessagePart::text("done"),
                MessagePart::ToolUse(ToolUse::new("c1", "t", serde_json::json!({"k": 1}))),
            ]);
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: LlmMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.text_content(), "done");
            assert_eq!(parsed.tool_uses().len(), 1);
        }
    }
}
