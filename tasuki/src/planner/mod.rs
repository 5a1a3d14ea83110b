//! Planner: converts a natural-language task into a workflow.
//!
//! Planning streams XML from the planning LLM pool; every accumulated
//! prefix runs through the tolerant parser so partial workflows reach the
//! callback while the model is still emitting. Only the final parse (with
//! `stream_done: true`) is authoritative.

mod prompts;
mod replan;

pub(crate) use replan::maybe_replan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::callback::StreamMessage;
use crate::context::TaskContext;
use crate::error::{LlmError, Result, TaskError};
use crate::llm::{LlmRequest, Llms, StreamChunk};
use crate::message::LlmMessage;
use crate::workflow::{ParsedPlan, Workflow, WorkflowAgent, parse_workflow};

/// Output token cap for planning calls.
const PLAN_MAX_TOKENS: u32 = 8192;
/// Sampling temperature for planning calls.
const PLAN_TEMPERATURE: f32 = 0.7;
/// Attempts before planning fails.
const PLAN_RETRIES: usize = 3;
/// Sleep between planning attempts.
const PLAN_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Plan the task and install the workflow on the task context.
///
/// # Errors
///
/// Returns [`TaskError::PlanFailed`] after three failed attempts, or
/// [`TaskError::Aborted`] when the task signal fires.
pub async fn plan_workflow(
    task: &Arc<TaskContext>,
    llms: &Llms,
    save_history: bool,
) -> Result<Workflow> {
    let datetime = chrono::Utc::now().to_rfc3339();
    let messages = vec![
        LlmMessage::system(prompts::plan_system_prompt(task.agents())),
        LlmMessage::user(prompts::plan_user_prompt(
            task.chain().task_prompt(),
            &datetime,
        )),
    ];
    let (plan, raw, request) = run_plan_call(task, llms, messages, true).await?;
    let workflow = build_workflow(task.task_id(), task.chain().task_prompt(), &plan);
    if save_history {
        task.chain().record_plan(request, raw);
    }
    task.set_workflow(workflow.clone());
    task.emit(StreamMessage::Workflow {
        xml: workflow.xml.clone(),
        stream_done: true,
    })
    .await;
    Ok(workflow)
}

/// Re-plan from scratch with a new instruction, continuing the original
/// planning conversation when one exists.
///
/// # Errors
///
/// Same contract as [`plan_workflow`].
pub async fn replan_with_instruction(
    task: &Arc<TaskContext>,
    llms: &Llms,
    instruction: &str,
    save_history: bool,
) -> Result<Workflow> {
    let (Some(plan_request), Some(plan_result)) =
        (task.chain().plan_request(), task.chain().plan_result())
    else {
        return plan_workflow(task, llms, save_history).await;
    };

    let mut messages = plan_request.messages;
    messages.push(LlmMessage::assistant(plan_result));
    messages.push(LlmMessage::user(instruction));

    let (plan, raw, request) = run_plan_call(task, llms, messages, true).await?;
    let workflow = build_workflow(task.task_id(), task.chain().task_prompt(), &plan);
    if save_history {
        task.chain().record_plan(request, raw);
    }
    task.set_workflow(workflow.clone());
    task.emit(StreamMessage::Workflow {
        xml: workflow.xml.clone(),
        stream_done: true,
    })
    .await;
    Ok(workflow)
}

/// Stream one planning call with retries, returning the parsed plan, the
/// raw XML, and the request that produced it.
pub(crate) async fn run_plan_call(
    task: &Arc<TaskContext>,
    llms: &Llms,
    messages: Vec<LlmMessage>,
    emit_partial: bool,
) -> Result<(ParsedPlan, String, LlmRequest)> {
    let request = LlmRequest::new(messages)
        .with_temperature(PLAN_TEMPERATURE)
        .with_max_tokens(PLAN_MAX_TOKENS);
    let keys = task.config().plan_llms.clone();
    let mut last_error = String::new();

    for attempt in 0..PLAN_RETRIES {
        if attempt > 0 {
            tokio::select! {
                () = tokio::time::sleep(PLAN_RETRY_SLEEP) => {}
                () = task.signal().cancelled() => return Err(task.signal().to_error()),
            }
        }

        let mut stream = match llms.stream(&keys, &request, task.signal()).await {
            Ok(stream) => stream,
            Err(LlmError::Aborted) => return Err(task.signal().to_error()),
            Err(e) => {
                warn!(attempt, error = %e, "Planning stream failed to open");
                last_error = e.to_string();
                continue;
            }
        };

        let mut buffer = String::new();
        let mut stream_failed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamChunk::TextDelta { text }) => {
                    buffer.push_str(&text);
                    if emit_partial {
                        emit_partial_workflow(task, &buffer).await;
                    }
                }
                Ok(StreamChunk::Finish { usage, .. }) => task.add_usage(usage),
                Ok(_) => {}
                Err(LlmError::Aborted) => return Err(task.signal().to_error()),
                Err(e) => {
                    warn!(attempt, error = %e, "Planning stream failed mid-read");
                    last_error = e.to_string();
                    stream_failed = true;
                    break;
                }
            }
        }
        if stream_failed {
            continue;
        }

        match parse_workflow(&buffer, false) {
            Ok(plan) => {
                debug!(agents = plan.agents.len(), "Planning succeeded");
                return Ok((plan, buffer, request));
            }
            Err(e) => {
                warn!(attempt, error = %e, "Planner output failed to parse");
                last_error = e.to_string();
            }
        }
    }
    Err(TaskError::PlanFailed(last_error))
}

/// Tolerantly parse the accumulated prefix and stream it as a partial
/// workflow; parse failures are silently skipped.
async fn emit_partial_workflow(task: &Arc<TaskContext>, buffer: &str) {
    if let Ok(plan) = parse_workflow(buffer, true) {
        let workflow = build_workflow(task.task_id(), task.chain().task_prompt(), &plan);
        task.emit(StreamMessage::Workflow {
            xml: workflow.xml,
            stream_done: false,
        })
        .await;
    }
}

/// Materialize a parsed plan: assign stable agent ids and rewrite the
/// model's dependency references onto them.
pub(crate) fn build_workflow(task_id: &str, task_prompt: &str, plan: &ParsedPlan) -> Workflow {
    let mut id_map: HashMap<String, String> = HashMap::new();
    let mut name_map: HashMap<String, String> = HashMap::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for (i, parsed) in plan.agents.iter().enumerate() {
        let new_id = format!("{task_id}-{i:03}");
        if let Some(emitted) = &parsed.emitted_id {
            id_map.entry(emitted.clone()).or_insert_with(|| new_id.clone());
        }
        id_map.entry(i.to_string()).or_insert_with(|| new_id.clone());
        name_map
            .entry(parsed.name.clone())
            .or_insert_with(|| new_id.clone());
        position.insert(new_id, i);
    }

    let agents: Vec<WorkflowAgent> = plan
        .agents
        .iter()
        .enumerate()
        .map(|(i, parsed)| {
            let own_id = format!("{task_id}-{i:03}");
            let mut depends_on = Vec::new();
            for reference in &parsed.depends_on {
                let resolved = id_map
                    .get(reference)
                    .or_else(|| name_map.get(reference))
                    .cloned();
                match resolved {
                    Some(id) if position.get(&id).is_some_and(|&p| p < i) => {
                        if !depends_on.contains(&id) {
                            depends_on.push(id);
                        }
                    }
                    Some(_) => {
                        warn!(agent = %parsed.name, reference = %reference, "Dropping forward dependency");
                    }
                    None => {
                        warn!(agent = %parsed.name, reference = %reference, "Dropping unresolved dependency");
                    }
                }
            }
            WorkflowAgent {
                id: own_id,
                name: parsed.name.clone(),
                task: parsed.task.clone(),
                depends_on,
                nodes: parsed.nodes.clone(),
            }
        })
        .collect();

    Workflow::new(task_id, task_prompt, plan.name.clone(), plan.thought.clone(), agents)
}
