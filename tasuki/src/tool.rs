//! Tool trait and registry for agent toolsets.
//!
//! Tools are the primary way agents act on the world. Each tool exposes a
//! JSON-schema parameter description for LLM function calling and an
//! `execute` entry point that runs under the calling agent's context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;

/// One part of a tool result body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolPart {
    /// Plain text output.
    Text {
        /// The text content.
        text: String,
    },
    /// Image output.
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type (e.g., "image/png").
        mime_type: String,
    },
    /// File output.
    File {
        /// Base64-encoded file data.
        data: String,
        /// MIME type of the file.
        mime_type: String,
    },
}

/// Result of a tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    /// Ordered result parts.
    pub content: Vec<ToolPart>,
    /// Whether the invocation failed.
    #[serde(default)]
    pub is_error: bool,
    /// Optional provider- or tool-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_info: Option<serde_json::Map<String, Value>>,
}

impl ToolResult {
    /// Create a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolPart::Text { text: text.into() }],
            is_error: false,
            ext_info: None,
        }
    }

    /// Create an error result with a text explanation.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolPart::Text { text: text.into() }],
            is_error: true,
            ext_info: None,
        }
    }

    /// Create a successful result from a serializable value.
    #[must_use]
    pub fn json(value: &Value) -> Self {
        Self::text(serde_json::to_string(value).unwrap_or_else(|_| value.to_string()))
    }

    /// Attach extra info.
    #[must_use]
    pub fn with_ext_info(mut self, ext_info: serde_json::Map<String, Value>) -> Self {
        self.ext_info = Some(ext_info);
        self
    }

    /// First text part, if any.
    #[must_use]
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|part| match part {
            ToolPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Render the result as a single string for conversation history.
    #[must_use]
    pub fn render(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                ToolPart::Text { text } => text.clone(),
                ToolPart::Image { mime_type, .. } => format!("[image {mime_type}]"),
                ToolPart::File { mime_type, .. } => format!("[file {mime_type}]"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Definition of a tool for LLM function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name in snake_case.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// The core trait for all tools agents can use.
///
/// Implementations receive the raw resolved arguments together with the
/// calling agent's context, so tools can read and write task variables,
/// reach the callback, or observe the abort signal.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name of the tool, unique within an agent's effective toolset.
    fn name(&self) -> &str;

    /// Description of what the tool does.
    fn description(&self) -> String;

    /// JSON schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Whether the tool is hidden from planning prompts.
    fn no_plan(&self) -> bool {
        false
    }

    /// The definition used in LLM requests.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name().to_owned(), self.description(), self.parameters())
    }

    /// Execute the tool with resolved arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError`] on failure; the dispatcher converts it into
    /// a `ToolResult { is_error: true }` rather than propagating.
    async fn execute(
        &self,
        args: Value,
        ctx: &AgentContext,
        call: &ToolUse,
    ) -> Result<ToolResult, ToolError>;
}

/// An agent's effective toolset, preserving registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// Returns `false` and leaves the registry unchanged when a tool with
    /// the same name is already present; the first registration wins so
    /// that discovered tools cannot shadow built-ins.
    pub fn add(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_owned();
        if self.index.contains_key(&name) {
            tracing::warn!(tool = %name, "Skipping duplicate tool registration");
            return false;
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        true
    }

    /// Get a tool by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Whether the registry contains a tool with the given name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All tool definitions in registration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Names of all tools in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Names of tools visible to the planner (those without `no_plan`).
    #[must_use]
    pub fn planning_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|t| !t.no_plan())
            .map(|t| t.name())
            .collect()
    }

    /// Remove every tool whose name satisfies the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.tools.retain(|t| keep(t.name()));
        self.index = self
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name().to_owned(), i))
            .collect();
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
