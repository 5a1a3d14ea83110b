//! Agent definition: a named role with a private toolset.
//!
//! An [`Agent`] is registered once with the runtime and referenced by the
//! planner; each task execution derives a fresh [`crate::context::AgentContext`]
//! and drives the agent through one ReAct loop.

mod dispatcher;
mod executor;

pub(crate) use dispatcher::dispatch_tool_calls;
pub(crate) use executor::run_agent;

use std::fmt;
use std::sync::Arc;

use crate::context::AgentContext;
use crate::mcp::{McpControl, McpControlHook, McpListToolsParams, McpService, McpTool};
use crate::message::LlmMessage;
use crate::tool::{Tool, ToolRegistry};
use crate::tools::{DEFAULT_SERIAL_TOOLS, builtin_tools};

/// A named role with a private toolset and prompt, executing one ReAct loop
/// per scheduled workflow entry.
pub struct Agent {
    name: String,
    description: String,
    plan_description: Option<String>,
    instructions: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    llm_keys: Option<Vec<String>>,
    temperature: Option<f32>,
    max_turns: Option<usize>,
    parallel_tool_calls: bool,
    serial_tools: Vec<String>,
    replan_after_turns: Option<usize>,
    mcp: Option<Arc<dyn McpService>>,
    mcp_control: Option<McpControlHook>,
}

impl Agent {
    /// Create an agent with just a name and description.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::builder(name).description(description).build()
    }

    /// Start building an agent.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// The agent's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's description, shown in prompts.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The description shown to the planner; falls back to the description.
    #[must_use]
    pub fn plan_description(&self) -> &str {
        self.plan_description.as_deref().unwrap_or(&self.description)
    }

    /// Extra system-prompt instructions, if any.
    #[must_use]
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// The agent's own tools (without built-ins or discovered tools).
    #[must_use]
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Tool names visible to the planner.
    #[must_use]
    pub fn planning_tool_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|t| !t.no_plan())
            .map(|t| t.name())
            .collect()
    }

    /// Ordered LLM pool keys for this agent.
    #[must_use]
    pub fn llm_keys(&self) -> Vec<String> {
        self.llm_keys
            .clone()
            .unwrap_or_else(|| vec![crate::config::DEFAULT_LLM_KEY.to_owned()])
    }

    /// Per-agent temperature override.
    #[must_use]
    pub const fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Per-agent ReAct turn cap override.
    #[must_use]
    pub const fn max_turns(&self) -> Option<usize> {
        self.max_turns
    }

    /// Whether tool calls in one turn may run concurrently.
    #[must_use]
    pub const fn parallel_tool_calls(&self) -> bool {
        self.parallel_tool_calls
    }

    /// Whether the named tool must never run concurrently with others.
    #[must_use]
    pub fn is_serial_tool(&self, name: &str) -> bool {
        self.serial_tools.iter().any(|s| s == name)
    }

    /// Consult the replanner every N turns, when set.
    #[must_use]
    pub const fn replan_after_turns(&self) -> Option<usize> {
        self.replan_after_turns
    }

    /// The agent's MCP service, if any.
    #[must_use]
    pub fn mcp(&self) -> Option<&Arc<dyn McpService>> {
        self.mcp.as_ref()
    }

    /// Evaluate the per-turn discovery hook.
    #[must_use]
    pub fn control_mcp_tools(&self, turn: usize, messages: &[LlmMessage]) -> McpControl {
        self.mcp_control
            .as_ref()
            .map(|hook| hook(turn, messages))
            .unwrap_or_default()
    }

    /// Build the effective toolset: own tools, then built-ins, then tools
    /// discovered over MCP. Earlier registrations win name collisions, so
    /// discovered tools can never shadow local ones. `extras` is merged
    /// into the discovery request (used by the per-turn refresh hook).
    pub(crate) async fn build_registry(
        &self,
        ctx: &AgentContext,
        extras: serde_json::Map<String, serde_json::Value>,
    ) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in &self.tools {
            registry.add(Arc::clone(tool));
        }
        for tool in builtin_tools() {
            registry.add(tool);
        }
        self.merge_mcp_tools(&mut registry, ctx, extras).await;
        registry
    }

    /// Run discovery and merge the results into the registry.
    async fn merge_mcp_tools(
        &self,
        registry: &mut ToolRegistry,
        ctx: &AgentContext,
        extras: serde_json::Map<String, serde_json::Value>,
    ) {
        let Some(mcp) = &self.mcp else { return };
        let task = ctx.task();
        if !mcp.is_connected()
            && let Err(e) = mcp.connect(task.signal()).await
        {
            tracing::warn!(agent = %self.name, error = %e, "MCP connect failed");
            return;
        }
        let params = McpListToolsParams {
            environment: None,
            agent_name: Some(self.name.clone()),
            prompt: Some(task.chain().task_prompt().to_owned()),
            extras,
        };
        match mcp.list_tools(&params).await {
            Ok(decls) => {
                for decl in decls {
                    registry.add(Arc::new(McpTool::new(decl, Arc::clone(mcp))));
                }
            }
            Err(e) => {
                tracing::warn!(agent = %self.name, error = %e, "MCP discovery failed");
            }
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Agent`].
///
/// # Example
///
/// ```rust,ignore
/// let agent = Agent::builder("Browser")
///     .description("Navigates the web and extracts content")
///     .tool(Arc::new(NavigateTool))
///     .parallel_tool_calls(true)
///     .build();
/// ```
pub struct AgentBuilder {
    name: String,
    description: String,
    plan_description: Option<String>,
    instructions: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    llm_keys: Option<Vec<String>>,
    temperature: Option<f32>,
    max_turns: Option<usize>,
    parallel_tool_calls: bool,
    serial_tools: Vec<String>,
    replan_after_turns: Option<usize>,
    mcp: Option<Arc<dyn McpService>>,
    mcp_control: Option<McpControlHook>,
}

impl AgentBuilder {
    /// Create a builder for the named agent.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            plan_description: None,
            instructions: None,
            tools: Vec::new(),
            llm_keys: None,
            temperature: None,
            max_turns: None,
            parallel_tool_calls: false,
            serial_tools: DEFAULT_SERIAL_TOOLS.iter().map(|s| (*s).to_owned()).collect(),
            replan_after_turns: None,
            mcp: None,
            mcp_control: None,
        }
    }

    /// Set the description shown in prompts.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a separate planning-scope description.
    #[must_use]
    pub fn plan_description(mut self, description: impl Into<String>) -> Self {
        self.plan_description = Some(description.into());
        self
    }

    /// Append extra system-prompt instructions.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add several tools.
    #[must_use]
    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Use these LLM pool keys instead of `default`.
    #[must_use]
    pub fn llms(mut self, keys: Vec<String>) -> Self {
        self.llm_keys = Some(keys);
        self
    }

    /// Override the sampling temperature for this agent.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Override the ReAct turn cap for this agent.
    #[must_use]
    pub const fn max_turns(mut self, turns: usize) -> Self {
        self.max_turns = Some(turns);
        self
    }

    /// Allow tool calls within one turn to run concurrently.
    #[must_use]
    pub const fn parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    /// Add a tool name to the serial list.
    #[must_use]
    pub fn serial_tool(mut self, name: impl Into<String>) -> Self {
        self.serial_tools.push(name.into());
        self
    }

    /// Consult the replanner every N turns.
    #[must_use]
    pub const fn replan_after_turns(mut self, turns: usize) -> Self {
        self.replan_after_turns = Some(turns);
        self
    }

    /// Attach an MCP service for tool discovery.
    #[must_use]
    pub fn mcp(mut self, service: Arc<dyn McpService>) -> Self {
        self.mcp = Some(service);
        self
    }

    /// Set the per-turn discovery refresh hook.
    #[must_use]
    pub fn mcp_control(mut self, hook: McpControlHook) -> Self {
        self.mcp_control = Some(hook);
        self
    }

    /// Build the agent.
    #[must_use]
    pub fn build(self) -> Agent {
        Agent {
            name: self.name,
            description: self.description,
            plan_description: self.plan_description,
            instructions: self.instructions,
            tools: self.tools,
            llm_keys: self.llm_keys,
            temperature: self.temperature,
            max_turns: self.max_turns,
            parallel_tool_calls: self.parallel_tool_calls,
            serial_tools: self.serial_tools,
            replan_after_turns: self.replan_after_turns,
            mcp: self.mcp,
            mcp_control: self.mcp_control,
        }
    }
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;

    #[test]
    fn builder_defaults() {
        let agent = Agent::builder("Worker").description("does work").build();
        assert_eq!(agent.name(), "Worker");
        assert_eq!(agent.plan_description(), "does work");
        assert_eq!(agent.llm_keys(), vec!["default".to_owned()]);
        assert!(!agent.parallel_tool_calls());
        assert!(agent.is_serial_tool("human_interact"));
        assert!(agent.is_serial_tool("variable_storage"));
        assert!(!agent.is_serial_tool("file_write"));
    }

    #[test]
    fn plan_description_override() {
        let agent = Agent::builder("A")
            .description("long runtime description")
            .plan_description("short planning blurb")
            .build();
        assert_eq!(agent.plan_description(), "short planning blurb");
    }

    #[tokio::test]
    async fn registry_contains_own_and_builtin_tools() {
        let task = test_support::task_context();
        let ctx = test_support::agent_context(&task);
        let registry = ctx
            .agent()
            .build_registry(&ctx, serde_json::Map::new())
            .await;
        assert!(registry.contains("variable_storage"));
        assert!(registry.contains("human_interact"));
        assert!(registry.contains("task_node_status"));
        assert!(registry.contains("task_result"));
        assert!(registry.contains("foreach_task"));
    }

    #[test]
    fn control_hook_defaults_to_no_refresh() {
        let agent = Agent::new("A", "d");
        let control = agent.control_mcp_tools(3, &[]);
        assert!(!control.refresh);
    }
}
