//! Task orchestrator: plan, schedule, aggregate, stream.
//!
//! [`TaskRuntime`] is the top-level entry point. Each `run` builds a
//! [`TaskContext`], registers it in a process-wide registry (so external
//! inspectors can pause, resume or abort by task id), plans the workflow,
//! schedules the agents, and aggregates the outcome into a [`TaskResult`]
//! framed by `workflow_start` / `workflow_end` stream events.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use crate::callback::StreamMessage;
use crate::config::Config;
use crate::context::TaskContext;
use crate::error::{Result, TaskError};
use crate::llm::{LlmRequest, Llms, TokenUsage};
use crate::message::LlmMessage;
use crate::planner::plan_workflow;
use crate::scheduler::run_schedule;
use crate::workflow::{Workflow, WorkflowAgent, WorkflowNode};

/// Process-wide registry of running tasks, keyed by task id.
static TASK_REGISTRY: LazyLock<Mutex<HashMap<String, Arc<TaskContext>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn register_task(task: &Arc<TaskContext>) {
    TASK_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(task.task_id().to_owned(), Arc::clone(task));
}

fn unregister_task(task_id: &str) {
    TASK_REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(task_id);
}

/// Control handle for a running task, resolved from the global registry.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<TaskContext>,
}

impl TaskHandle {
    /// The task id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        self.task.task_id()
    }

    /// Pause the task at its next suspension point.
    pub fn pause(&self) {
        self.task.pause();
    }

    /// Resume a paused task.
    pub fn resume(&self) {
        self.task.resume();
    }

    /// Whether the task is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.task.is_paused()
    }

    /// Abort the task.
    pub fn abort(&self, reason: Option<String>) {
        self.task.abort(reason);
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id())
            .finish()
    }
}

/// The aggregated outcome of a task run.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Whether every scheduled agent completed.
    pub success: bool,
    /// The final result text (last agent's result, or a composed summary).
    pub result: String,
    /// Error summaries for failed or skipped agents.
    pub errors: Vec<String>,
    /// Token usage accumulated across planning and all agents.
    pub usage: TokenUsage,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// The (possibly replanned) workflow; `None` when planning failed.
    pub workflow: Option<Workflow>,
    /// The execution chain, partial on failure.
    pub chain: Arc<crate::chain::TaskChain>,
}

/// The multi-agent task runtime.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::builder()
///     .llm("default", provider)
///     .agent(Agent::builder("File").description("writes files").tool(file_tool).build())
///     .build()?;
/// let runtime = TaskRuntime::new(config);
/// let outcome = runtime.run("Write 'hello' to /tmp/a.txt").await?;
/// ```
#[derive(Debug, Clone)]
pub struct TaskRuntime {
    config: Arc<Config>,
}

impl TaskRuntime {
    /// Create a runtime from a validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Resolve a control handle for a running task.
    #[must_use]
    pub fn task_handle(task_id: &str) -> Option<TaskHandle> {
        TASK_REGISTRY
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|task| TaskHandle {
                task: Arc::clone(task),
            })
    }

    /// Ids of all currently running tasks.
    #[must_use]
    pub fn active_tasks() -> Vec<String> {
        TASK_REGISTRY
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Run a natural-language task end to end.
    ///
    /// Agent failures do not raise: they are aggregated into a
    /// `TaskResult { success: false, .. }` with the partial chain.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Aborted`] when the task is aborted.
    pub async fn run(&self, task_prompt: impl Into<String>) -> Result<TaskResult> {
        let task_prompt = task_prompt.into();
        let task = self.new_task(&task_prompt);
        register_task(&task);
        let outcome = self.execute(&task, true).await;
        unregister_task(task.task_id());
        outcome
    }

    /// Run a single pre-selected agent, bypassing the planner.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::AgentNotFound`] for an unknown agent name and
    /// [`TaskError::Aborted`] when the task is aborted.
    pub async fn run_with_agent(
        &self,
        agent_name: &str,
        task_prompt: impl Into<String>,
    ) -> Result<TaskResult> {
        let task_prompt = task_prompt.into();
        let task = self.new_task(&task_prompt);
        let agent = task
            .agent_by_name(agent_name)
            .ok_or_else(|| TaskError::AgentNotFound(agent_name.to_owned()))?;

        let mut wf_agent = WorkflowAgent {
            id: format!("{}-000", task.task_id()),
            name: agent.name().to_owned(),
            task: task_prompt.clone(),
            depends_on: Vec::new(),
            nodes: vec![WorkflowNode::step(&task_prompt)],
        };
        wf_agent.renumber_nodes();
        let workflow = Workflow::new(
            task.task_id(),
            &task_prompt,
            agent.name(),
            "single-agent execution",
            vec![wf_agent],
        );
        task.set_workflow(workflow);

        register_task(&task);
        let outcome = self.execute(&task, false).await;
        unregister_task(task.task_id());
        outcome
    }

    fn new_task(&self, task_prompt: &str) -> Arc<TaskContext> {
        let task_id = format!("task-{}", Uuid::new_v4().simple());
        let chat_id = format!("chat-{}", Uuid::new_v4().simple());
        TaskContext::new(
            task_id,
            chat_id,
            task_prompt,
            Arc::clone(&self.config),
            self.config.agents.clone(),
        )
    }

    async fn execute(&self, task: &Arc<TaskContext>, plan: bool) -> Result<TaskResult> {
        let started = Instant::now();
        let llms = Llms::from_config(&self.config);

        task.emit(StreamMessage::WorkflowStart).await;
        info!(task = task.task_id(), "Task started");

        if plan {
            match plan_workflow(task, &llms, true).await {
                Ok(_) => {}
                Err(e) if e.is_aborted() => return Err(self.aborted(task, e).await),
                Err(e) => {
                    return Ok(self
                        .finish(task, started, vec![e.to_string()], String::new())
                        .await);
                }
            }
        } else if let Some(workflow) = task.workflow() {
            task.emit(StreamMessage::Workflow {
                xml: workflow.xml,
                stream_done: true,
            })
            .await;
        }

        let report = match run_schedule(task).await {
            Ok(report) => report,
            Err(e) if e.is_aborted() => return Err(self.aborted(task, e).await),
            Err(e) => {
                return Ok(self
                    .finish(task, started, vec![e.to_string()], String::new())
                    .await);
            }
        };

        let mut errors: Vec<String> = report
            .failures
            .iter()
            .map(|(id, error)| format!("{id}: {error}"))
            .collect();
        for skipped in &report.skipped {
            errors.push(format!("{skipped}: skipped (dependency not satisfied)"));
        }

        let mut result = last_agent_result(task).unwrap_or_default();
        if errors.is_empty()
            && self.config.compose_final
            && let Some(composed) = compose_final_result(task, &llms).await
        {
            result = composed;
        }

        Ok(self.finish(task, started, errors, result).await)
    }

    async fn aborted(&self, task: &Arc<TaskContext>, error: TaskError) -> TaskError {
        task.emit(StreamMessage::Error {
            error: error.to_string(),
        })
        .await;
        info!(task = task.task_id(), "Task aborted");
        error
    }

    async fn finish(
        &self,
        task: &Arc<TaskContext>,
        started: Instant,
        errors: Vec<String>,
        result: String,
    ) -> TaskResult {
        let success = errors.is_empty();
        let usage = task.total_usage();
        let duration_ms = started.elapsed().as_millis() as u64;
        task.emit(StreamMessage::WorkflowEnd {
            success,
            duration_ms,
            usage,
        })
        .await;
        info!(
            task = task.task_id(),
            success, duration_ms, "Task finished"
        );
        TaskResult {
            success,
            result,
            errors,
            usage,
            duration_ms,
            workflow: task.workflow(),
            chain: Arc::clone(task.chain()),
        }
    }
}

/// The result of the last workflow agent that recorded one.
fn last_agent_result(task: &Arc<TaskContext>) -> Option<String> {
    let workflow = task.workflow()?;
    workflow
        .agents
        .iter()
        .rev()
        .find_map(|agent| task.chain().agent_by_id(&agent.id).and_then(|c| c.result()))
}

/// Optional model-composed summary of all agent results.
async fn compose_final_result(task: &Arc<TaskContext>, llms: &Llms) -> Option<String> {
    let results: Vec<String> = task
        .chain()
        .agents()
        .iter()
        .filter_map(|a| a.result().map(|r| format!("- {}: {r}", a.agent_name())))
        .collect();
    if results.is_empty() {
        return None;
    }
    let prompt = format!(
        "The task was: {}\n\nAgent results:\n{}\n\nCompose the single final \
         answer for the user. Reply with the answer only.",
        task.chain().task_prompt(),
        results.join("\n")
    );
    let request = LlmRequest::new(vec![LlmMessage::user(prompt)]);
    let keys = vec![crate::config::DEFAULT_LLM_KEY.to_owned()];
    let outcome = tokio::time::timeout(
        task.config().meta_llm_timeout,
        llms.generate(&keys, &request, task.signal()),
    )
    .await;
    match outcome {
        Ok(Ok(result)) => {
            let text = result.text();
            (!text.is_empty()).then_some(text)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Final composition failed; using last agent result");
            None
        }
        Err(_) => {
            warn!("Final composition timed out; using last agent result");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LLM_KEY;
    use crate::llm::MockProvider;

    const SINGLE_AGENT_PLAN: &str = r#"<root>
<name>Echo task</name>
<thought>One agent suffices.</thought>
<agents>
  <agent name="Solo" id="0">
    <task>say the word</task>
    <nodes><node>say it</node></nodes>
  </agent>
</agents>
</root>"#;

    fn runtime_with(provider: Arc<MockProvider>) -> TaskRuntime {
        let config = Config::builder()
            .llm(DEFAULT_LLM_KEY, provider)
            .agent(crate::agent::Agent::new("Solo", "answers directly"))
            .build()
            .unwrap();
        TaskRuntime::new(config)
    }

    #[tokio::test]
    async fn run_plans_schedules_and_aggregates() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text(SINGLE_AGENT_PLAN);
        provider.push_text("the word");
        let runtime = runtime_with(provider);

        let outcome = runtime.run("say the word").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, "the word");
        assert!(outcome.errors.is_empty());
        assert!(outcome.usage.total() > 0);
        let workflow = outcome.workflow.unwrap();
        assert_eq!(workflow.agents.len(), 1);
        assert_eq!(outcome.chain.agents().len(), 1);
    }

    #[tokio::test]
    async fn run_with_agent_bypasses_planning() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text("direct answer");
        let runtime = runtime_with(Arc::clone(&provider));

        let outcome = runtime
            .run_with_agent("Solo", "answer directly")
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, "direct answer");
        // Exactly one LLM call: no planning round.
        assert_eq!(provider.call_count(), 1);
        let workflow = outcome.workflow.unwrap();
        assert_eq!(workflow.agents.len(), 1);
        assert_eq!(workflow.agents[0].name, "Solo");
    }

    #[tokio::test]
    async fn run_with_unknown_agent_fails() {
        let runtime = runtime_with(Arc::new(MockProvider::new()));
        let err = runtime.run_with_agent("Ghost", "x").await.unwrap_err();
        assert!(matches!(err, TaskError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn plan_failure_returns_unsuccessful_result() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..3 {
            provider.push_text("<root><agents><agent na");
        }
        let runtime = runtime_with(provider);

        let outcome = runtime.run("impossible").await.unwrap();
        assert!(!outcome.success);
        assert!(!outcome.errors.is_empty());
        assert!(outcome.workflow.is_none());
    }

    #[tokio::test]
    async fn handle_resolves_only_while_running() {
        assert!(TaskRuntime::task_handle("task-nope").is_none());
        let provider = Arc::new(MockProvider::new());
        provider.push_text(SINGLE_AGENT_PLAN);
        provider.push_text("done");
        let runtime = runtime_with(provider);
        let outcome = runtime.run("quick").await.unwrap();
        // Unregistered after completion.
        assert!(TaskRuntime::task_handle(outcome.chain.task_id()).is_none());
    }

    #[tokio::test]
    async fn compose_final_uses_summary_call() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text(SINGLE_AGENT_PLAN);
        provider.push_text("raw agent answer");
        provider.push_text("polished summary");
        let config = Config::builder()
            .llm(DEFAULT_LLM_KEY, provider)
            .agent(crate::agent::Agent::new("Solo", "answers directly"))
            .compose_final(true)
            .build()
            .unwrap();
        let runtime = TaskRuntime::new(config);

        let outcome = runtime.run("summarize me").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, "polished summary");
    }
}
