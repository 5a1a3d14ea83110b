//! Execution chain: the recorded, streamable trace of a task run.
//!
//! A [`TaskChain`] owns one [`AgentChain`] per started agent, which in turn
//! owns one [`ToolChain`] per dispatched tool call. Every leaf mutation
//! emits a single update event to all chain listeners, synchronously on the
//! writer's thread; listeners must be non-blocking or hand off to their own
//! executor.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::llm::LlmRequest;
use crate::message::ToolUse;
use crate::tool::ToolResult;

/// A chain listener function value.
pub type ChainListener = Arc<dyn Fn(&ChainUpdate) + Send + Sync>;

/// Identifier returned by [`TaskChain::subscribe`].
pub type SubscriptionId = u64;

/// An update event delivered to chain listeners.
#[derive(Debug, Clone)]
pub struct ChainUpdate {
    /// Id of the task whose chain changed.
    pub task_id: String,
    /// What changed.
    pub kind: ChainUpdateKind,
}

/// The kind of chain mutation that produced an update.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainUpdateKind {
    /// The planning request/result pair was recorded.
    PlanRecorded,
    /// An agent chain was appended.
    AgentAdded {
        /// The agent's workflow id.
        agent_id: String,
    },
    /// An agent request snapshot was recorded.
    AgentRequest {
        /// The agent's workflow id.
        agent_id: String,
    },
    /// An agent result was recorded.
    AgentResult {
        /// The agent's workflow id.
        agent_id: String,
    },
    /// A tool chain was appended.
    ToolAdded {
        /// The owning agent's workflow id.
        agent_id: String,
        /// The tool call id.
        tool_call_id: String,
    },
    /// Resolved params were recorded on a tool chain.
    ToolParams {
        /// The owning agent's workflow id.
        agent_id: String,
        /// The tool call id.
        tool_call_id: String,
    },
    /// A result was recorded on a tool chain.
    ToolResult {
        /// The owning agent's workflow id.
        agent_id: String,
        /// The tool call id.
        tool_call_id: String,
    },
}

/// Shared fan-out point cloned into every chain node.
#[derive(Clone)]
struct ChainEmitter {
    task_id: String,
    listeners: Arc<Mutex<Vec<(SubscriptionId, ChainListener)>>>,
}

impl ChainEmitter {
    fn emit(&self, kind: ChainUpdateKind) {
        let update = ChainUpdate {
            task_id: self.task_id.clone(),
            kind,
        };
        // Snapshot under the lock, invoke outside it so a listener may
        // subscribe or unsubscribe without deadlocking.
        let listeners: Vec<ChainListener> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(&update);
        }
    }
}

impl fmt::Debug for ChainEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEmitter")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// The hierarchical record of a task's execution.
#[derive(Debug)]
pub struct TaskChain {
    task_id: String,
    task_prompt: String,
    plan_request: Mutex<Option<LlmRequest>>,
    plan_result: Mutex<Option<String>>,
    agents: Mutex<Vec<Arc<AgentChain>>>,
    emitter: ChainEmitter,
    next_subscription: AtomicU64,
}

impl TaskChain {
    /// Create a new task chain.
    #[must_use]
    pub fn new(task_id: impl Into<String>, task_prompt: impl Into<String>) -> Arc<Self> {
        let task_id = task_id.into();
        Arc::new(Self {
            emitter: ChainEmitter {
                task_id: task_id.clone(),
                listeners: Arc::new(Mutex::new(Vec::new())),
            },
            task_id,
            task_prompt: task_prompt.into(),
            plan_request: Mutex::new(None),
            plan_result: Mutex::new(None),
            agents: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        })
    }

    /// The task id this chain records.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The original task prompt.
    #[must_use]
    pub fn task_prompt(&self) -> &str {
        &self.task_prompt
    }

    /// Register a listener; it receives every subsequent chain update.
    pub fn subscribe(&self, listener: ChainListener) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.emitter
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.emitter
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sub, _)| *sub != id);
    }

    /// Record the planning request and result.
    pub fn record_plan(&self, request: LlmRequest, result: impl Into<String>) {
        *self.plan_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request);
        *self.plan_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.into());
        self.emitter.emit(ChainUpdateKind::PlanRecorded);
    }

    /// The recorded planning request, if any.
    #[must_use]
    pub fn plan_request(&self) -> Option<LlmRequest> {
        self.plan_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The recorded planning result, if any.
    #[must_use]
    pub fn plan_result(&self) -> Option<String> {
        self.plan_result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Append an agent chain for a started agent.
    pub fn add_agent(
        &self,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        task: impl Into<String>,
    ) -> Arc<AgentChain> {
        let agent = Arc::new(AgentChain {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            task: task.into(),
            request: Mutex::new(None),
            result: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            call_seq: AtomicU64::new(0),
            emitter: self.emitter.clone(),
        });
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&agent));
        self.emitter.emit(ChainUpdateKind::AgentAdded {
            agent_id: agent.agent_id.clone(),
        });
        agent
    }

    /// All agent chains, in start order.
    #[must_use]
    pub fn agents(&self) -> Vec<Arc<AgentChain>> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Look up an agent chain by workflow agent id.
    #[must_use]
    pub fn agent_by_id(&self, agent_id: &str) -> Option<Arc<AgentChain>> {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.agent_id == agent_id)
            .cloned()
    }
}

/// Trace record of one agent execution.
#[derive(Debug)]
pub struct AgentChain {
    agent_id: String,
    agent_name: String,
    task: String,
    request: Mutex<Option<LlmRequest>>,
    result: Mutex<Option<String>>,
    tools: Mutex<Vec<Arc<ToolChain>>>,
    call_seq: AtomicU64,
    emitter: ChainEmitter,
}

impl AgentChain {
    /// The workflow agent id.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The agent's display name.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// The task text assigned to the agent.
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Record the most recent LLM request issued for this agent.
    pub fn set_request(&self, request: LlmRequest) {
        *self.request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request);
        self.emitter.emit(ChainUpdateKind::AgentRequest {
            agent_id: self.agent_id.clone(),
        });
    }

    /// The most recent recorded LLM request.
    #[must_use]
    pub fn request(&self) -> Option<LlmRequest> {
        self.request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the agent's final result text (or error summary).
    pub fn set_result(&self, result: impl Into<String>) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.into());
        self.emitter.emit(ChainUpdateKind::AgentResult {
            agent_id: self.agent_id.clone(),
        });
    }

    /// The agent's recorded result, if finished.
    #[must_use]
    pub fn result(&self) -> Option<String> {
        self.result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Append a tool chain for a dispatched call.
    ///
    /// The call is captured by value so later message mutations cannot
    /// retroactively alter the trace. Tool-call ids are unique within this
    /// agent chain; when a provider reuses an id, a monotonic sequence
    /// number is prefixed to restore uniqueness.
    pub fn add_tool(&self, call: &ToolUse) -> Arc<ToolChain> {
        let mut tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        let mut tool_call_id = call.id.clone();
        if tools.iter().any(|t| t.tool_call_id == tool_call_id) {
            let seq = self.call_seq.fetch_add(1, Ordering::SeqCst);
            tool_call_id = format!("{seq}#{tool_call_id}");
        }
        let tool = Arc::new(ToolChain {
            tool_name: call.name.clone(),
            tool_call_id,
            request: call.clone(),
            params: Mutex::new(None),
            result: Mutex::new(None),
            created_at: Utc::now(),
            agent_id: self.agent_id.clone(),
            emitter: self.emitter.clone(),
        });
        tools.push(Arc::clone(&tool));
        drop(tools);
        self.emitter.emit(ChainUpdateKind::ToolAdded {
            agent_id: self.agent_id.clone(),
            tool_call_id: tool.tool_call_id.clone(),
        });
        tool
    }

    /// All tool chains, in dispatch order.
    #[must_use]
    pub fn tools(&self) -> Vec<Arc<ToolChain>> {
        self.tools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Trace record of one tool call.
#[derive(Debug)]
pub struct ToolChain {
    tool_name: String,
    tool_call_id: String,
    request: ToolUse,
    params: Mutex<Option<Value>>,
    result: Mutex<Option<ToolResult>>,
    created_at: DateTime<Utc>,
    agent_id: String,
    emitter: ChainEmitter,
}

impl ToolChain {
    /// Name of the invoked tool.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// The (deduplicated) tool call id.
    #[must_use]
    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    /// The tool call as captured at creation.
    #[must_use]
    pub const fn request(&self) -> &ToolUse {
        &self.request
    }

    /// When the call was recorded.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record the resolved call params.
    pub fn set_params(&self, params: Value) {
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = Some(params);
        self.emitter.emit(ChainUpdateKind::ToolParams {
            agent_id: self.agent_id.clone(),
            tool_call_id: self.tool_call_id.clone(),
        });
    }

    /// The recorded params, if resolved.
    #[must_use]
    pub fn params(&self) -> Option<Value> {
        self.params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the tool result.
    pub fn set_result(&self, result: ToolResult) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        self.emitter.emit(ChainUpdateKind::ToolResult {
            agent_id: self.agent_id.clone(),
            tool_call_id: self.tool_call_id.clone(),
        });
    }

    /// The recorded result, if finished.
    #[must_use]
    pub fn result(&self) -> Option<ToolResult> {
        self.result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
