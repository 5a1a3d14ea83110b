//! Per-task and per-agent execution state.
//!
//! A [`TaskContext`] is created at `run` entry and shared by everything the
//! task touches: configuration, the execution chain, the variable map, the
//! abort signal and the pause flag. An [`AgentContext`] derives from it for
//! the lifetime of one agent execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;

use crate::agent::Agent;
use crate::callback::{StreamMessage, StreamPayload};
use crate::chain::{AgentChain, TaskChain};
use crate::config::Config;
use crate::error::{Result, TaskError};
use crate::llm::TokenUsage;
use crate::message::LlmMessage;
use crate::workflow::{Workflow, WorkflowAgent};

/// How often the pause loop re-checks the flags.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// A cooperatively observed cancellation signal.
///
/// Cloning is cheap; all clones observe the same state. Aborting wakes every
/// pending [`AbortSignal::cancelled`] future.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl AbortSignal {
    /// Create a fresh, un-aborted signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                aborted: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Fire the signal, waking all waiters.
    pub fn abort(&self, reason: Option<String>) {
        {
            let mut guard = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                *guard = reason;
            }
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// The reason supplied to `abort`, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve once the signal fires; resolves immediately if already fired.
    pub async fn cancelled(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// The abort as a [`TaskError`].
    #[must_use]
    pub fn to_error(&self) -> TaskError {
        TaskError::Aborted {
            reason: self.reason(),
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Per-task state shared by the planner, scheduler and every agent.
pub struct TaskContext {
    task_id: String,
    chat_id: String,
    config: Arc<Config>,
    signal: AbortSignal,
    paused: AtomicBool,
    chain: Arc<TaskChain>,
    workflow: RwLock<Option<Workflow>>,
    agents: Vec<Arc<Agent>>,
    variables: Mutex<HashMap<String, Value>>,
    usage: Mutex<TokenUsage>,
}

impl TaskContext {
    /// Create the context for a new task run.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        chat_id: impl Into<String>,
        task_prompt: &str,
        config: Arc<Config>,
        agents: Vec<Arc<Agent>>,
    ) -> Arc<Self> {
        let task_id = task_id.into();
        Arc::new(Self {
            chain: TaskChain::new(&task_id, task_prompt),
            task_id,
            chat_id: chat_id.into(),
            config,
            signal: AbortSignal::new(),
            paused: AtomicBool::new(false),
            workflow: RwLock::new(None),
            agents,
            variables: Mutex::new(HashMap::new()),
            usage: Mutex::new(TokenUsage::default()),
        })
    }

    /// The task id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The chat this task belongs to.
    #[must_use]
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The execution chain.
    #[must_use]
    pub fn chain(&self) -> &Arc<TaskChain> {
        &self.chain
    }

    /// The task abort signal.
    #[must_use]
    pub const fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// The agents registered for this task.
    #[must_use]
    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    /// Look up a registered agent by name.
    #[must_use]
    pub fn agent_by_name(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.name() == name).cloned()
    }

    /// Abort the task.
    pub fn abort(&self, reason: Option<String>) {
        self.signal.abort(reason);
    }

    /// Pause the task at its next suspension point.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume a paused task.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the task is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Check the abort and pause flags at a suspension point.
    ///
    /// While paused, blocks cooperatively (polling every ~100 ms) until
    /// resumed or aborted. Returns `true` when aborted and `throw_on_abort`
    /// is false.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Aborted`] when aborted and `throw_on_abort` is
    /// set.
    pub async fn check_aborted(&self, throw_on_abort: bool) -> Result<bool> {
        loop {
            if self.signal.is_aborted() {
                if throw_on_abort {
                    return Err(self.signal.to_error());
                }
                return Ok(true);
            }
            if !self.is_paused() {
                return Ok(false);
            }
            tokio::time::sleep(PAUSE_POLL).await;
        }
    }

    /// Read a task-scoped variable.
    #[must_use]
    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Write a task-scoped variable (last writer wins).
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    /// Snapshot of all task-scoped variables.
    #[must_use]
    pub fn variables(&self) -> HashMap<String, Value> {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Snapshot of the current workflow, if planned.
    #[must_use]
    pub fn workflow(&self) -> Option<Workflow> {
        self.workflow
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Install a freshly planned workflow.
    pub fn set_workflow(&self, workflow: Workflow) {
        *self.workflow.write().unwrap_or_else(|e| e.into_inner()) = Some(workflow);
    }

    /// Mutate the workflow in place under the write lock.
    ///
    /// Returns `None` when no workflow is installed yet.
    pub fn with_workflow_mut<R>(&self, f: impl FnOnce(&mut Workflow) -> R) -> Option<R> {
        let mut guard = self.workflow.write().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(f)
    }

    /// Add token usage to the task total.
    pub fn add_usage(&self, usage: TokenUsage) {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner()) += usage;
    }

    /// Total token usage accumulated by the task so far.
    #[must_use]
    pub fn total_usage(&self) -> TokenUsage {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit a task-scoped stream message through the callback.
    pub async fn emit(&self, message: StreamMessage) {
        let payload = StreamPayload::task(&self.chat_id, &self.task_id, message);
        self.config.callback.on_message(&payload).await;
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("chat_id", &self.chat_id)
            .field("paused", &self.is_paused())
            .field("aborted", &self.signal.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Per-agent-execution state derived from a [`TaskContext`].
pub struct AgentContext {
    task: Arc<TaskContext>,
    agent: Arc<Agent>,
    agent_chain: Arc<AgentChain>,
    variables: Mutex<HashMap<String, Value>>,
    consecutive_errors: AtomicU32,
    current_node: AtomicU32,
    messages: Mutex<Vec<LlmMessage>>,
}

impl AgentContext {
    /// Create the context for one agent execution.
    #[must_use]
    pub fn new(task: Arc<TaskContext>, agent: Arc<Agent>, agent_chain: Arc<AgentChain>) -> Self {
        Self {
            task,
            agent,
            agent_chain,
            variables: Mutex::new(HashMap::new()),
            consecutive_errors: AtomicU32::new(0),
            current_node: AtomicU32::new(0),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// The owning task context.
    #[must_use]
    pub fn task(&self) -> &Arc<TaskContext> {
        &self.task
    }

    /// The executing agent.
    #[must_use]
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// This execution's chain entry.
    #[must_use]
    pub fn agent_chain(&self) -> &Arc<AgentChain> {
        &self.agent_chain
    }

    /// The workflow node this agent executes, from the live workflow.
    #[must_use]
    pub fn workflow_agent(&self) -> Option<WorkflowAgent> {
        self.task.workflow().and_then(|w| {
            w.agents
                .iter()
                .find(|a| a.id == self.agent_chain.agent_id())
                .cloned()
        })
    }

    /// Read an agent-scoped variable.
    #[must_use]
    pub fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Write an agent-scoped variable.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    /// Current consecutive all-error turn count.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Record an all-error turn; returns the new count.
    pub fn record_error_turn(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the consecutive-error counter after a good turn.
    pub fn reset_error_turns(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// The workflow node the agent currently reports being on.
    #[must_use]
    pub fn current_node(&self) -> Option<u32> {
        match self.current_node.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Update the current workflow node.
    pub fn set_current_node(&self, node_id: u32) {
        self.current_node.store(node_id, Ordering::SeqCst);
    }

    /// Append a message to the conversation history.
    pub fn push_message(&self, message: LlmMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    /// Snapshot of the conversation history.
    #[must_use]
    pub fn messages(&self) -> Vec<LlmMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of messages in the conversation history.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an agent-scoped stream message through the callback.
    pub async fn emit(&self, message: StreamMessage) {
        let mut payload = StreamPayload::task(self.task.chat_id(), self.task.task_id(), message)
            .for_agent(self.agent.name());
        if let Some(node) = self.current_node() {
            payload = payload.at_node(node);
        }
        self.task.config().callback.on_message(&payload).await;
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("task_id", &self.task.task_id())
            .field("agent", &self.agent.name())
            .field("consecutive_errors", &self.consecutive_errors())
            .finish_non_exhaustive()
    }
}
