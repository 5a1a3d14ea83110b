//! Dependency-aware multi-agent scheduler.
//!
//! Builds a DAG from the workflow's `depends_on` edges and drives agents
//! through rounds of concurrent execution. The ready set is recomputed
//! from the live workflow before every round, so a replanned suffix is
//! picked up at the next round boundary without special casing.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::run_agent;
use crate::config::FailurePolicy;
use crate::context::{AgentContext, TaskContext};
use crate::error::{Result, TaskError};
use crate::workflow::{Workflow, WorkflowAgent};

/// Outcome of scheduling one task's workflow.
#[derive(Debug, Default)]
pub(crate) struct ScheduleReport {
    /// Agents that finished successfully, in completion order.
    pub completed: Vec<String>,
    /// Agents that failed, with their error summaries.
    pub failures: Vec<(String, String)>,
    /// Agents never started (failed or unsatisfiable dependencies).
    pub skipped: Vec<String>,
}

impl ScheduleReport {
    /// Whether every scheduled agent completed.
    pub(crate) fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

/// Validate the workflow's dependency graph; cycles are a hard failure.
pub(crate) fn check_cycles(workflow: &Workflow) -> Result<()> {
    let ids: HashSet<&str> = workflow.agents.iter().map(|a| a.id.as_str()).collect();
    let mut resolved: HashSet<&str> = HashSet::new();
    // Kahn's algorithm over the declared edges; unknown references do not
    // count as blocking here (the ready computation treats them the same).
    loop {
        let mut progressed = false;
        for agent in &workflow.agents {
            if resolved.contains(agent.id.as_str()) {
                continue;
            }
            let unblocked = agent
                .depends_on
                .iter()
                .all(|d| !ids.contains(d.as_str()) || resolved.contains(d.as_str()));
            if unblocked {
                resolved.insert(agent.id.as_str());
                progressed = true;
            }
        }
        if resolved.len() == workflow.agents.len() {
            return Ok(());
        }
        if !progressed {
            let stuck = workflow
                .agents
                .iter()
                .find(|a| !resolved.contains(a.id.as_str()))
                .map_or_else(String::new, |a| a.id.clone());
            return Err(TaskError::DependencyCycle(stuck));
        }
    }
}

/// One agent's result within a round.
struct AgentRun {
    agent_id: String,
    result: Result<String>,
}

/// Execute the task's workflow to completion.
///
/// # Errors
///
/// Returns [`TaskError::Aborted`] when the task signal fires and
/// [`TaskError::DependencyCycle`] when the graph is cyclic; agent failures
/// are reported in the [`ScheduleReport`] instead of being raised.
pub(crate) async fn run_schedule(task: &Arc<TaskContext>) -> Result<ScheduleReport> {
    let Some(workflow) = task.workflow() else {
        return Ok(ScheduleReport::default());
    };
    check_cycles(&workflow)?;
    if workflow.agents.is_empty() {
        info!(task = task.task_id(), "Workflow has no agents; nothing to do");
        return Ok(ScheduleReport::default());
    }

    let policy = task.config().failure_policy;
    let mut report = ScheduleReport::default();
    let mut started: HashSet<String> = HashSet::new();
    let mut completed: HashSet<String> = HashSet::new();
    let mut stop = false;

    while !stop {
        task.check_aborted(true).await?;

        // Re-snapshot: a replan may have swapped the unexecuted suffix.
        let Some(workflow) = task.workflow() else { break };
        check_cycles(&workflow)?;
        let known: HashSet<&str> = workflow.agents.iter().map(|a| a.id.as_str()).collect();

        let ready: Vec<WorkflowAgent> = workflow
            .agents
            .iter()
            .filter(|a| !started.contains(&a.id))
            .filter(|a| {
                a.depends_on
                    .iter()
                    .all(|d| completed.contains(d) || !known.contains(d.as_str()))
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            break;
        }

        let cap = task
            .config()
            .max_concurrent_agents
            .unwrap_or(ready.len())
            .max(1);
        let batch: Vec<WorkflowAgent> = ready.into_iter().take(cap).collect();
        debug!(
            task = task.task_id(),
            batch = batch.len(),
            "Dispatching scheduling round"
        );

        let mut join_set: JoinSet<AgentRun> = JoinSet::new();
        for wf_agent in batch {
            started.insert(wf_agent.id.clone());
            let Some(agent) = task.agent_by_name(&wf_agent.name) else {
                report.failures.push((
                    wf_agent.id.clone(),
                    format!("no registered agent named '{}'", wf_agent.name),
                ));
                if matches!(policy, FailurePolicy::FailFast | FailurePolicy::Retry(_)) {
                    stop = true;
                }
                continue;
            };
            let chain = task
                .chain()
                .add_agent(&wf_agent.id, &wf_agent.name, &wf_agent.task);
            let task_ref = Arc::clone(task);
            let retries = match policy {
                FailurePolicy::Retry(extra) => extra,
                _ => 0,
            };
            join_set.spawn(async move {
                let agent_id = wf_agent.id.clone();
                let mut attempt = 0;
                loop {
                    let ctx = Arc::new(AgentContext::new(
                        Arc::clone(&task_ref),
                        Arc::clone(&agent),
                        Arc::clone(&chain),
                    ));
                    let result = run_agent(&ctx).await;
                    match &result {
                        Err(e) if !e.is_aborted() && attempt < retries => {
                            warn!(agent = %agent_id, attempt, error = %e, "Retrying failed agent");
                            attempt += 1;
                        }
                        _ => return AgentRun { agent_id, result },
                    }
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let run = match joined {
                Ok(run) => run,
                Err(e) => {
                    report
                        .failures
                        .push(("<join>".to_owned(), format!("agent task panicked: {e}")));
                    stop = true;
                    continue;
                }
            };
            match run.result {
                Ok(_) => {
                    completed.insert(run.agent_id.clone());
                    report.completed.push(run.agent_id);
                }
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    report.failures.push((run.agent_id, e.to_string()));
                    if matches!(policy, FailurePolicy::FailFast | FailurePolicy::Retry(_)) {
                        stop = true;
                    }
                }
            }
        }
    }

    if let Some(workflow) = task.workflow() {
        for agent in &workflow.agents {
            if !started.contains(&agent.id) {
                report.skipped.push(agent.id.clone());
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_LLM_KEY};
    use crate::llm::MockProvider;
    use crate::workflow::WorkflowNode;
    use std::time::Duration;

    fn wf_agent(id: &str, name: &str, deps: &[&str]) -> WorkflowAgent {
        WorkflowAgent {
            id: id.into(),
            name: name.into(),
            task: format!("task for {name}"),
            depends_on: deps.iter().map(|s| (*s).to_owned()).collect(),
            nodes: vec![WorkflowNode::step("do it")],
        }
    }

    fn task_with_workflow(
        provider: Arc<MockProvider>,
        agents: Vec<crate::agent::Agent>,
        workflow: Workflow,
        policy: FailurePolicy,
    ) -> Arc<TaskContext> {
        let config = Config::builder()
            .llm(DEFAULT_LLM_KEY, provider)
            .failure_policy(policy)
            .build()
            .unwrap();
        let agents: Vec<Arc<crate::agent::Agent>> = agents.into_iter().map(Arc::new).collect();
        let task = TaskContext::new("t", "c", "prompt", Arc::new(config), agents);
        task.set_workflow(workflow);
        task
    }

    #[test]
    fn cycle_detection_rejects_cycles() {
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![
                wf_agent("t-000", "A", &["t-001"]),
                wf_agent("t-001", "B", &["t-000"]),
            ],
        );
        let err = check_cycles(&workflow).unwrap_err();
        assert!(matches!(err, TaskError::DependencyCycle(_)));

        let acyclic = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![
                wf_agent("t-000", "A", &[]),
                wf_agent("t-001", "B", &["t-000"]),
            ],
        );
        check_cycles(&acyclic).unwrap();
    }

    #[tokio::test]
    async fn dependent_agent_runs_after_its_dependency() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text("first done");
        provider.push_text("second done");
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![
                wf_agent("t-000", "First", &[]),
                wf_agent("t-001", "Second", &["t-000"]),
            ],
        );
        let task = task_with_workflow(
            provider,
            vec![
                crate::agent::Agent::new("First", "runs first"),
                crate::agent::Agent::new("Second", "runs second"),
            ],
            workflow,
            FailurePolicy::FailFast,
        );

        let report = run_schedule(&task).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed, vec!["t-000", "t-001"]);

        // Dependency respect: the dependent agent started only after its
        // dependency completed, so chain order matches.
        let chains = task.chain().agents();
        assert_eq!(chains[0].agent_id(), "t-000");
        assert_eq!(chains[1].agent_id(), "t-001");
        assert_eq!(chains[0].result().as_deref(), Some("first done"));
    }

    #[tokio::test]
    async fn independent_agents_share_a_round() {
        let provider = Arc::new(MockProvider::new());
        provider.push_text("a done");
        provider.push_text("b done");
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![wf_agent("t-000", "A", &[]), wf_agent("t-001", "B", &[])],
        );
        let task = task_with_workflow(
            provider,
            vec![
                crate::agent::Agent::new("A", "independent"),
                crate::agent::Agent::new("B", "independent"),
            ],
            workflow,
            FailurePolicy::FailFast,
        );

        let report = run_schedule(&task).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 2);
    }

    #[tokio::test]
    async fn fail_fast_skips_dependents() {
        // First agent consumes three all-error turns.
        let bad = Arc::new(MockProvider::new());
        for _ in 0..3 {
            bad.push_tool_call("missing_tool", serde_json::json!({}));
        }
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![
                wf_agent("t-000", "Bad", &[]),
                wf_agent("t-001", "Never", &["t-000"]),
            ],
        );
        let task = task_with_workflow(
            bad,
            vec![
                crate::agent::Agent::new("Bad", "always fails"),
                crate::agent::Agent::new("Never", "unreachable"),
            ],
            workflow,
            FailurePolicy::FailFast,
        );

        let report = run_schedule(&task).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "t-000");
        assert_eq!(report.skipped, vec!["t-001"]);
        // Only one agent chain: the dependent never started.
        assert_eq!(task.chain().agents().len(), 1);
    }

    #[tokio::test]
    async fn retry_policy_reruns_failed_agent() {
        let provider = Arc::new(MockProvider::new());
        // Attempt 1: three all-error turns. Attempt 2: clean finish.
        for _ in 0..3 {
            provider.push_tool_call("missing_tool", serde_json::json!({}));
        }
        provider.push_text("recovered");
        let workflow = Workflow::new("t", "p", "n", "th", vec![wf_agent("t-000", "Flaky", &[])]);
        let task = task_with_workflow(
            provider,
            vec![crate::agent::Agent::new("Flaky", "fails then recovers")],
            workflow,
            FailurePolicy::Retry(1),
        );

        let report = run_schedule(&task).await.unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.completed, vec!["t-000"]);
        // One chain entry despite two attempts.
        assert_eq!(task.chain().agents().len(), 1);
        assert_eq!(task.chain().agents()[0].result().as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn best_effort_continues_past_failures() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..3 {
            provider.push_tool_call("missing_tool", serde_json::json!({}));
        }
        provider.push_text("b done");
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![wf_agent("t-000", "Bad", &[]), wf_agent("t-001", "Good", &[])],
        );
        // Cap at one agent per round so the scripted turns line up
        // deterministically with the agents that consume them.
        let task = {
            let config = Config::builder()
                .llm(DEFAULT_LLM_KEY, provider)
                .failure_policy(FailurePolicy::BestEffort)
                .max_concurrent_agents(1)
                .build()
                .unwrap();
            let agents = vec![
                Arc::new(crate::agent::Agent::new("Bad", "fails")),
                Arc::new(crate::agent::Agent::new("Good", "succeeds")),
            ];
            let task = TaskContext::new("t", "c", "prompt", Arc::new(config), agents);
            task.set_workflow(workflow);
            task
        };

        let report = run_schedule(&task).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.completed.len(), 1);
    }

    #[tokio::test]
    async fn abort_stops_dispatching() {
        let provider = Arc::new(MockProvider::new().with_delay(Duration::from_secs(10)));
        provider.push_text("never");
        provider.push_text("never");
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![
                wf_agent("t-000", "Slow", &[]),
                wf_agent("t-001", "Later", &["t-000"]),
            ],
        );
        let task = task_with_workflow(
            provider,
            vec![
                crate::agent::Agent::new("Slow", "slow"),
                crate::agent::Agent::new("Later", "later"),
            ],
            workflow,
            FailurePolicy::FailFast,
        );

        let aborter = Arc::clone(&task);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            aborter.abort(Some("stop".into()));
        });

        let start = std::time::Instant::now();
        let err = run_schedule(&task).await.unwrap_err();
        assert!(err.is_aborted());
        assert!(start.elapsed() < Duration::from_millis(500));
        // The dependent agent never started.
        assert_eq!(task.chain().agents().len(), 1);
    }

    #[tokio::test]
    async fn concurrency_cap_limits_round_size() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..3 {
            provider.push_text("done");
        }
        let workflow = Workflow::new(
            "t",
            "p",
            "n",
            "th",
            vec![
                wf_agent("t-000", "A", &[]),
                wf_agent("t-001", "B", &[]),
                wf_agent("t-002", "C", &[]),
            ],
        );
        let task = {
            let config = Config::builder()
                .llm(DEFAULT_LLM_KEY, provider)
                .max_concurrent_agents(1)
                .build()
                .unwrap();
            let agents = vec![
                Arc::new(crate::agent::Agent::new("A", "a")),
                Arc::new(crate::agent::Agent::new("B", "b")),
                Arc::new(crate::agent::Agent::new("C", "c")),
            ];
            let task = TaskContext::new("t", "c", "prompt", Arc::new(config), agents);
            task.set_workflow(workflow);
            task
        };

        let report = run_schedule(&task).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 3);
    }
}
