//! Mid-flight replanning: judge the remaining plan, rewrite the suffix.
//!
//! Both entry points run inline in the currently executing agent, so the
//! workflow mutation is serialized naturally: other agents are parked at a
//! scheduling barrier while one agent executes its replan hook.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::prompts;
use crate::callback::StreamMessage;
use crate::context::AgentContext;
use crate::error::{Result, TaskError};
use crate::llm::{LlmRequest, Llms, ToolChoice};
use crate::message::LlmMessage;
use crate::tool::Tool;
use crate::tools::CheckTaskStatusTool;
use crate::workflow::{ParsedPlan, Workflow, WorkflowAgent};

/// Longest agent-result excerpt included in the status summary.
const RESULT_EXCERPT: usize = 500;
/// Longest message-log excerpt for the in-progress agent.
const LOG_EXCERPT: usize = 1500;

/// Consult the judge and, when it votes to replan, splice a fresh suffix.
pub(crate) async fn maybe_replan(ctx: &Arc<AgentContext>, llms: &Llms) {
    if !should_replan(ctx, llms).await {
        return;
    }
    info!(agent = ctx.agent().name(), "Judge voted to replan the suffix");
    if let Err(e) = replan_suffix(ctx, llms).await {
        warn!(error = %e, "Suffix replan failed; keeping the current plan");
    }
}

/// Ask the planning LLM whether the remaining plan is still valid.
///
/// The judgment is a forced `check_task_status` call on the original
/// planning conversation plus a status summary. Any failure (timeout,
/// provider error, missing plan history) counts as "keep the plan".
pub(crate) async fn should_replan(ctx: &Arc<AgentContext>, llms: &Llms) -> bool {
    let task = ctx.task();
    let (Some(plan_request), Some(plan_result)) =
        (task.chain().plan_request(), task.chain().plan_result())
    else {
        return false;
    };
    let Some(summary) = status_summary(ctx) else {
        return false;
    };

    let mut messages = plan_request.messages;
    messages.push(LlmMessage::assistant(plan_result));
    messages.push(LlmMessage::user(prompts::judge_user_prompt(&summary)));

    let request = LlmRequest::new(messages)
        .with_tools(vec![CheckTaskStatusTool.definition()])
        .with_tool_choice(ToolChoice::Tool("check_task_status".to_owned()))
        .with_temperature(0.0);
    let keys = task.config().plan_llms.clone();

    let outcome = tokio::time::timeout(
        task.config().meta_llm_timeout,
        llms.generate(&keys, &request, task.signal()),
    )
    .await;

    match outcome {
        Ok(Ok(result)) => {
            let verdict = result
                .tool_uses()
                .first()
                .and_then(|call| call.resolved_arguments().ok())
                .and_then(|args| args.get("replan").and_then(serde_json::Value::as_bool))
                .unwrap_or(false);
            debug!(verdict, "Replan judgment");
            verdict
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Replan judgment call failed");
            false
        }
        Err(_) => {
            warn!("Replan judgment timed out");
            false
        }
    }
}

/// Per-agent status: completed / in progress (with a truncated log) / not
/// started. `None` when no workflow is installed.
fn status_summary(ctx: &Arc<AgentContext>) -> Option<String> {
    let task = ctx.task();
    let workflow = task.workflow()?;
    let current_id = ctx.agent_chain().agent_id().to_owned();

    let mut summary = String::new();
    for agent in &workflow.agents {
        let result = task.chain().agent_by_id(&agent.id).and_then(|c| c.result());
        if let Some(result) = result {
            summary.push_str(&format!(
                "- {} ({}): completed. Result: {}\n",
                agent.name,
                agent.id,
                excerpt(&result, RESULT_EXCERPT)
            ));
        } else if agent.id == current_id {
            let log: String = ctx
                .messages()
                .iter()
                .skip(2) // system and task prompts add nothing here
                .map(|m| format!("[{}] {}", m.role.as_str(), m.text_content()))
                .collect::<Vec<_>>()
                .join("\n");
            summary.push_str(&format!(
                "- {} ({}): in progress. Recent activity:\n{}\n",
                agent.name,
                agent.id,
                excerpt(&log, LOG_EXCERPT)
            ));
        } else {
            summary.push_str(&format!("- {} ({}): not started\n", agent.name, agent.id));
        }
    }
    Some(summary)
}

fn excerpt(text: &str, max: usize) -> &str {
    let mut end = text.len().min(max);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Re-plan the suffix starting at the currently executing agent and splice
/// it into the live workflow.
pub(crate) async fn replan_suffix(ctx: &Arc<AgentContext>, llms: &Llms) -> Result<()> {
    let task = ctx.task();
    let workflow = task
        .workflow()
        .ok_or_else(|| TaskError::PlanFailed("no workflow installed".to_owned()))?;
    let current_id = ctx.agent_chain().agent_id();
    let current_index = workflow
        .agent_index(current_id)
        .ok_or_else(|| TaskError::PlanFailed(format!("agent '{current_id}' not in workflow")))?;

    let executed: Vec<(String, Option<String>)> = workflow.agents[..=current_index]
        .iter()
        .map(|agent| {
            let result = task.chain().agent_by_id(&agent.id).and_then(|c| c.result());
            (format!("{} ({})", agent.name, agent.id), result)
        })
        .collect();

    let (Some(plan_request), Some(plan_result)) =
        (task.chain().plan_request(), task.chain().plan_result())
    else {
        return Err(TaskError::PlanFailed("no plan history".to_owned()));
    };
    let mut messages = plan_request.messages;
    messages.push(LlmMessage::assistant(plan_result));
    messages.push(LlmMessage::user(prompts::replan_suffix_instruction(
        &executed,
    )));

    let (plan, _raw, _request) = super::run_plan_call(task, llms, messages, false).await?;

    let xml = task
        .with_workflow_mut(|workflow| {
            splice_suffix(workflow, current_index, &plan);
            workflow.xml.clone()
        })
        .ok_or_else(|| TaskError::PlanFailed("workflow disappeared during replan".to_owned()))?;

    task.emit(StreamMessage::Workflow {
        xml,
        stream_done: true,
    })
    .await;
    Ok(())
}

/// Replace everything after `current_index` with the re-planned agents.
///
/// The executed prefix (including the current agent) is left untouched.
/// New agents get ids continuing the zero-padded sequence; the first new
/// agent depends on the last surviving agent, and later new agents'
/// emitted references are index-shifted into the new id space.
pub(crate) fn splice_suffix(workflow: &mut Workflow, current_index: usize, plan: &ParsedPlan) {
    workflow.agents.truncate(current_index + 1);
    let task_id = workflow.task_id.clone();
    let base = current_index + 1;

    let mut id_map: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for (i, parsed) in plan.agents.iter().enumerate() {
        let new_id = format!("{task_id}-{:03}", base + i);
        if let Some(emitted) = &parsed.emitted_id {
            id_map.entry(emitted.clone()).or_insert_with(|| new_id.clone());
        }
        id_map.entry(i.to_string()).or_insert_with(|| new_id.clone());
    }

    let last_surviving = workflow.agents[current_index].id.clone();
    for (i, parsed) in plan.agents.iter().enumerate() {
        let own_id = format!("{task_id}-{:03}", base + i);
        let depends_on = if i == 0 {
            vec![last_surviving.clone()]
        } else {
            let mut deps = Vec::new();
            for reference in &parsed.depends_on {
                match id_map.get(reference) {
                    Some(id) if *id != own_id && !deps.contains(id) => deps.push(id.clone()),
                    Some(_) => {}
                    None => {
                        warn!(reference = %reference, "Dropping unresolved replan dependency");
                    }
                }
            }
            deps
        };
        workflow.agents.push(WorkflowAgent {
            id: own_id,
            name: parsed.name.clone(),
            task: parsed.task.clone(),
            depends_on,
            nodes: parsed.nodes.clone(),
        });
    }

    workflow.modified = true;
    workflow.refresh_xml();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_LLM_KEY};
    use crate::context::TaskContext;
    use crate::llm::MockProvider;
    use crate::workflow::parse_workflow;

    fn three_agent_workflow() -> Workflow {
        let agents = (0..3)
            .map(|i| WorkflowAgent {
                id: format!("t-{i:03}"),
                name: format!("P{}", i + 1),
                task: format!("task {i}"),
                depends_on: if i == 0 {
                    vec![]
                } else {
                    vec![format!("t-{:03}", i - 1)]
                },
                nodes: vec![crate::workflow::WorkflowNode::step(format!("step {i}"))],
            })
            .collect();
        Workflow::new("t", "prompt", "demo", "thought", agents)
    }

    const SUFFIX_XML: &str = r#"<root>
<agents>
  <agent name="P2x" id="0"><task>new second</task><nodes><node>a</node></nodes></agent>
  <agent name="P3x" id="1" dependsOn="0"><task>new third</task><nodes><node>b</node></nodes></agent>
  <agent name="P4x" id="2" dependsOn="1"><task>new fourth</task><nodes><node>c</node></nodes></agent>
</agents>
</root>"#;

    #[test]
    fn splice_preserves_prefix_and_rewrites_suffix() {
        let mut workflow = three_agent_workflow();
        let before_first = workflow.agents[0].clone();
        let plan = parse_workflow(SUFFIX_XML, false).unwrap();

        splice_suffix(&mut workflow, 0, &plan);

        assert!(workflow.modified);
        assert_eq!(workflow.agents.len(), 4);
        // Prefix untouched, by id and content.
        assert_eq!(workflow.agents[0], before_first);
        // New ids continue the sequence.
        assert_eq!(workflow.agents[1].id, "t-001");
        assert_eq!(workflow.agents[2].id, "t-002");
        assert_eq!(workflow.agents[3].id, "t-003");
        // First new agent depends on the last surviving agent.
        assert_eq!(workflow.agents[1].depends_on, vec!["t-000"]);
        // Later agents' emitted references are shifted into the new space.
        assert_eq!(workflow.agents[2].depends_on, vec!["t-001"]);
        assert_eq!(workflow.agents[3].depends_on, vec!["t-002"]);
        assert!(workflow.xml.contains("P4x"));
    }

    #[test]
    fn splice_mid_workflow_keeps_executed_agents() {
        let mut workflow = three_agent_workflow();
        let plan = parse_workflow(
            r#"<root><agents>
                <agent name="Tail" id="0"><task>finish up</task><nodes><node>t</node></nodes></agent>
            </agents></root>"#,
            false,
        )
        .unwrap();

        splice_suffix(&mut workflow, 1, &plan);

        assert_eq!(workflow.agents.len(), 3);
        assert_eq!(workflow.agents[0].name, "P1");
        assert_eq!(workflow.agents[1].name, "P2");
        assert_eq!(workflow.agents[2].name, "Tail");
        assert_eq!(workflow.agents[2].id, "t-002");
        assert_eq!(workflow.agents[2].depends_on, vec!["t-001"]);
    }

    fn judged_context(
        provider: Arc<MockProvider>,
    ) -> (Arc<TaskContext>, Arc<AgentContext>, Llms) {
        let config = Config::builder()
            .llm(DEFAULT_LLM_KEY, provider)
            .build()
            .unwrap();
        let agent = Arc::new(crate::agent::Agent::new("P1", "first"));
        let task = TaskContext::new("t", "c", "prompt", Arc::new(config), vec![Arc::clone(&agent)]);
        task.set_workflow(three_agent_workflow());
        task.chain()
            .record_plan(LlmRequest::new(vec![LlmMessage::user("plan it")]), "<root/>");
        let chain = task.chain().add_agent("t-000", "P1", "task 0");
        let ctx = Arc::new(AgentContext::new(Arc::clone(&task), agent, chain));
        let llms = Llms::from_config(task.config());
        (task, ctx, llms)
    }

    #[tokio::test]
    async fn judge_returns_verdict_from_forced_tool_call() {
        let provider = Arc::new(MockProvider::new());
        provider.push_tool_call(
            "check_task_status",
            serde_json::json!({"thinking": "stale", "replan": true}),
        );
        let (_task, ctx, llms) = judged_context(provider);
        assert!(should_replan(&ctx, &llms).await);
    }

    #[tokio::test]
    async fn judge_defaults_to_false_on_error() {
        let provider = Arc::new(MockProvider::new());
        provider.push_error(crate::error::LlmError::Auth {
            provider: "mock".into(),
            message: "denied".into(),
        });
        let (_task, ctx, llms) = judged_context(provider);
        assert!(!should_replan(&ctx, &llms).await);
    }

    #[tokio::test]
    async fn maybe_replan_splices_when_judge_votes_yes() {
        let provider = Arc::new(MockProvider::new());
        provider.push_tool_call(
            "check_task_status",
            serde_json::json!({"replan": true}),
        );
        provider.push_text(SUFFIX_XML);
        let (task, ctx, llms) = judged_context(provider);

        maybe_replan(&ctx, &llms).await;

        let workflow = task.workflow().unwrap();
        assert!(workflow.modified);
        assert_eq!(workflow.agents.len(), 4);
        assert_eq!(workflow.agents[1].name, "P2x");
        // The executing agent's chain entry is untouched.
        assert!(task.chain().agent_by_id("t-000").is_some());
    }

    #[tokio::test]
    async fn maybe_replan_keeps_plan_when_judge_votes_no() {
        let provider = Arc::new(MockProvider::new());
        provider.push_tool_call(
            "check_task_status",
            serde_json::json!({"replan": false}),
        );
        let (task, ctx, llms) = judged_context(provider);

        maybe_replan(&ctx, &llms).await;

        let workflow = task.workflow().unwrap();
        assert!(!workflow.modified);
        assert_eq!(workflow.agents.len(), 3);
    }
}
