//! The per-agent ReAct loop.
//!
//! Each turn streams one LLM response, relays deltas through the callback,
//! dispatches any tool calls, and appends the results to the conversation.
//! The loop ends when the model stops calling tools, when three consecutive
//! turns fail entirely, on abort, or at the turn cap.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callback::StreamMessage;
use crate::context::AgentContext;
use crate::error::{LlmError, Result, TaskError};
use crate::llm::{
    FinishReason, LlmRequest, Llms, StreamChunk, TokenUsage, ToolChoice,
};
use crate::message::{LlmMessage, MessagePart, ToolUse};
use crate::tool::Tool;
use crate::tools::{TASK_RESULT_VARIABLE, TodoListManagerTool};

use super::dispatch_tool_calls;

/// Consecutive all-error turns after which the agent gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Drive one agent execution to completion.
///
/// On success the returned string is the agent's result text; it is also
/// recorded on the agent chain. Non-abort failures record an error summary
/// on the chain before returning the error.
pub(crate) async fn run_agent(ctx: &Arc<AgentContext>) -> Result<String> {
    let task = Arc::clone(ctx.task());
    let agent = Arc::clone(ctx.agent());
    let config = Arc::clone(task.config());
    let llms = Llms::from_config(&config);
    let keys = agent.llm_keys();

    info!(agent = agent.name(), task = task.task_id(), "Starting agent");

    let mut registry = agent.build_registry(ctx, serde_json::Map::new()).await;

    ctx.push_message(LlmMessage::system(compose_system_prompt(ctx)));
    ctx.push_message(LlmMessage::user(compose_user_prompt(ctx)));

    let max_turns = agent.max_turns().unwrap_or(config.max_react_turns);
    let mut total_usage = TokenUsage::default();

    for turn in 1..=max_turns {
        task.check_aborted(true).await?;

        let control = agent.control_mcp_tools(turn, &ctx.messages());
        if control.refresh {
            debug!(agent = agent.name(), turn, "Refreshing MCP toolset");
            registry = agent.build_registry(ctx, control.params).await;
        }

        let mut request = LlmRequest::new(ctx.messages())
            .with_tools(registry.definitions())
            .with_tool_choice(ToolChoice::Auto)
            .with_temperature(
                agent
                    .temperature()
                    .unwrap_or(config.default_temperature),
            );
        if let Some(max_tokens) = config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        ctx.agent_chain().set_request(request.clone());

        let stream = match llms.stream(&keys, &request, task.signal()).await {
            Ok(stream) => stream,
            Err(LlmError::Aborted) => return Err(task.signal().to_error()),
            Err(e) => return Err(fail_agent(ctx, format!("LLM call failed: {e}"), total_usage, TaskError::Llm(e)).await),
        };

        let turn_outcome = read_turn(ctx, stream).await?;
        total_usage += turn_outcome.usage;
        task.add_usage(turn_outcome.usage);

        if let Some(error) = &turn_outcome.stream_error {
            ctx.emit(StreamMessage::Error {
                error: error.to_string(),
            })
            .await;
            let note = format!("The model response failed: {error}. Retry the step.");
            if error_turn(ctx, &note).await {
                return Err(consecutive_failure(ctx, total_usage).await);
            }
            continue;
        }

        let TurnOutput {
            text,
            thinking,
            calls,
            finish_reason,
            ..
        } = turn_outcome;

        let mut parts = Vec::new();
        if !thinking.is_empty() {
            parts.push(MessagePart::Thinking { text: thinking });
        }
        if !text.is_empty() {
            parts.push(MessagePart::text(text.clone()));
        }
        for call in &calls {
            parts.push(MessagePart::ToolUse(call.clone()));
        }

        if parts.is_empty() {
            if error_turn(ctx, "Your last response was empty. Continue the task.").await {
                return Err(consecutive_failure(ctx, total_usage).await);
            }
            continue;
        }
        ctx.push_message(LlmMessage::assistant_parts(parts));

        if calls.is_empty() {
            // Termination: the assistant text is the agent result, unless
            // an explicit result was recorded via task_result.
            let result = ctx
                .get_variable(TASK_RESULT_VARIABLE)
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or(text);
            ctx.agent_chain().set_result(&result);
            ctx.emit(StreamMessage::Finish {
                finish_reason,
                usage: total_usage,
                success: true,
            })
            .await;
            info!(agent = agent.name(), turn, "Agent finished");
            return Ok(result);
        }

        task.check_aborted(true).await?;
        let outcome = dispatch_tool_calls(ctx, &registry, calls).await;
        ctx.push_message(LlmMessage::tool_results(outcome.results));

        if task.signal().is_aborted() {
            ctx.agent_chain().set_result("Aborted");
            return Err(task.signal().to_error());
        }

        if outcome.all_errored {
            let count = ctx.record_error_turn();
            warn!(agent = agent.name(), turn, count, "All tool calls failed");
            if count >= MAX_CONSECUTIVE_ERRORS {
                return Err(consecutive_failure(ctx, total_usage).await);
            }
        } else {
            ctx.reset_error_turns();
        }

        if let Some(interval) = config.progress_check_interval
            && turn % interval == 0
        {
            run_progress_check(ctx, &llms, &keys).await;
        }

        if let Some(interval) = agent.replan_after_turns()
            && turn % interval == 0
        {
            crate::planner::maybe_replan(ctx, &llms).await;
        }
    }

    let summary = format!("Agent stopped after reaching the {max_turns}-turn limit");
    Err(fail_agent(
        ctx,
        summary,
        total_usage,
        TaskError::MaxTurns {
            agent: agent.name().to_owned(),
            turns: max_turns,
        },
    )
    .await)
}

/// Accumulated output of one streamed turn.
struct TurnOutput {
    text: String,
    thinking: String,
    calls: Vec<ToolUse>,
    finish_reason: FinishReason,
    usage: TokenUsage,
    stream_error: Option<LlmError>,
}

/// Read one LLM stream, relaying deltas through the callback.
async fn read_turn(
    ctx: &Arc<AgentContext>,
    mut stream: crate::llm::LlmStream,
) -> Result<TurnOutput> {
    let text_stream_id = Uuid::new_v4().simple().to_string();
    let thinking_stream_id = Uuid::new_v4().simple().to_string();

    let mut output = TurnOutput {
        text: String::new(),
        thinking: String::new(),
        calls: Vec::new(),
        finish_reason: FinishReason::Stop,
        usage: TokenUsage::default(),
        stream_error: None,
    };
    let mut streaming_args: HashMap<String, String> = HashMap::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamChunk::TextDelta { text }) => {
                output.text.push_str(&text);
                ctx.emit(StreamMessage::Text {
                    stream_id: text_stream_id.clone(),
                    text,
                    stream_done: false,
                })
                .await;
            }
            Ok(StreamChunk::ReasoningDelta { text }) => {
                output.thinking.push_str(&text);
                ctx.emit(StreamMessage::Thinking {
                    stream_id: thinking_stream_id.clone(),
                    text,
                    stream_done: false,
                })
                .await;
            }
            Ok(StreamChunk::ToolCallDelta {
                tool_call_id,
                tool_name,
                args_delta,
            }) => {
                let accumulated = streaming_args.entry(tool_call_id.clone()).or_default();
                accumulated.push_str(&args_delta);
                ctx.emit(StreamMessage::ToolStreaming {
                    tool_name,
                    tool_call_id,
                    params_text: accumulated.clone(),
                })
                .await;
            }
            Ok(StreamChunk::ToolCall(call)) => {
                output.calls.push(call);
            }
            Ok(StreamChunk::Finish { reason, usage }) => {
                output.finish_reason = reason;
                output.usage = usage;
            }
            Err(LlmError::Aborted) => {
                return Err(ctx.task().signal().to_error());
            }
            Err(e) => {
                warn!(error = %e, "LLM stream failed mid-read");
                output.stream_error = Some(e);
                break;
            }
        }
    }

    if output.stream_error.is_none() {
        if !output.thinking.is_empty() {
            ctx.emit(StreamMessage::Thinking {
                stream_id: thinking_stream_id,
                text: output.thinking.clone(),
                stream_done: true,
            })
            .await;
        }
        if !output.text.is_empty() {
            ctx.emit(StreamMessage::Text {
                stream_id: text_stream_id,
                text: output.text.clone(),
                stream_done: true,
            })
            .await;
        }
    }
    Ok(output)
}

/// Record an error turn with a corrective user note; returns `true` when
/// the consecutive-error limit is reached.
async fn error_turn(ctx: &Arc<AgentContext>, note: &str) -> bool {
    ctx.push_message(LlmMessage::user(note));
    ctx.record_error_turn() >= MAX_CONSECUTIVE_ERRORS
}

/// Record an error summary on the chain and emit the failure callbacks.
async fn fail_agent(
    ctx: &Arc<AgentContext>,
    summary: String,
    usage: TokenUsage,
    error: TaskError,
) -> TaskError {
    ctx.agent_chain().set_result(&summary);
    ctx.emit(StreamMessage::Error {
        error: summary.clone(),
    })
    .await;
    ctx.emit(StreamMessage::Finish {
        finish_reason: FinishReason::Error,
        usage,
        success: false,
    })
    .await;
    error
}

async fn consecutive_failure(ctx: &Arc<AgentContext>, usage: TokenUsage) -> TaskError {
    let count = ctx.consecutive_errors();
    let agent = ctx.agent().name().to_owned();
    fail_agent(
        ctx,
        format!("Agent '{agent}' failed {count} turns in a row"),
        usage,
        TaskError::ConsecutiveErrors { agent, count },
    )
    .await
}

/// Forced `todo_list_manager` call classifying progress and detecting
/// repetition; the verdict is injected as the next user message.
async fn run_progress_check(ctx: &Arc<AgentContext>, llms: &Llms, keys: &[String]) {
    let task = ctx.task();
    let definition = TodoListManagerTool.definition();
    let mut messages = ctx.messages();
    messages.push(LlmMessage::user(
        "Review the conversation so far. Classify which parts of the task \
         are completed and which are pending, and report whether the recent \
         turns are repeating themselves without progress.",
    ));
    let request = LlmRequest::new(messages)
        .with_tools(vec![definition])
        .with_tool_choice(ToolChoice::Tool("todo_list_manager".to_owned()))
        .with_temperature(0.0);

    let verdict = tokio::time::timeout(
        task.config().meta_llm_timeout,
        llms.generate(keys, &request, task.signal()),
    )
    .await;

    match verdict {
        Ok(Ok(result)) => {
            let Some(call) = result.tool_uses().first().copied().cloned() else {
                return;
            };
            let Ok(args) = call.resolved_arguments() else {
                return;
            };
            let completed = render_list(args.get("completed"));
            let pending = render_list(args.get("pending"));
            let looping = args
                .get("loop_detected")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let mut note = format!(
                "Progress check. Completed: {completed}. Pending: {pending}."
            );
            if looping {
                note.push_str(
                    " A repetition loop was detected; change your approach instead of retrying the same step.",
                );
            }
            ctx.push_message(LlmMessage::user(note));
        }
        Ok(Err(e)) => warn!(error = %e, "Progress check call failed"),
        Err(_) => warn!("Progress check timed out"),
    }
}

fn render_list(value: Option<&serde_json::Value>) -> String {
    let items: Vec<String> = value
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    if items.is_empty() {
        "none".to_owned()
    } else {
        items.join("; ")
    }
}

fn compose_system_prompt(ctx: &AgentContext) -> String {
    let task = ctx.task();
    let agent = ctx.agent();
    let mut prompt = format!(
        "You are {}, one agent in a multi-agent task runtime.\n{}\n",
        agent.name(),
        agent.description()
    );
    if let Some(instructions) = agent.instructions() {
        prompt.push('\n');
        prompt.push_str(instructions);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nCurrent datetime: {}\nOverall task: {}\n",
        chrono::Utc::now().to_rfc3339(),
        task.chain().task_prompt()
    ));

    let prior: Vec<String> = task
        .chain()
        .agents()
        .iter()
        .filter(|a| a.agent_id() != ctx.agent_chain().agent_id())
        .filter_map(|a| a.result().map(|r| format!("- {}: {r}", a.agent_name())))
        .collect();
    if !prior.is_empty() {
        prompt.push_str("\nResults from previous agents:\n");
        prompt.push_str(&prior.join("\n"));
        prompt.push('\n');
    }

    let mut variables: Vec<String> = task.variables().into_keys().collect();
    variables.sort();
    if !variables.is_empty() {
        prompt.push_str(&format!(
            "\nShared variables available via variable_storage: {}\n",
            variables.join(", ")
        ));
    }

    prompt.push_str(
        "\nWork through your plan nodes in order and mark them done with \
         task_node_status. Share data other agents need via variable_storage. \
         When your whole task is complete, answer with plain text and no tool \
         calls.",
    );
    prompt
}

fn compose_user_prompt(ctx: &AgentContext) -> String {
    let task = ctx.task();
    match ctx.workflow_agent() {
        Some(wf_agent) => format!(
            "Your task: {}\n\nYour plan:\n{}",
            wf_agent.task,
            wf_agent.to_xml()
        ),
        None => format!("Your task: {}", task.chain().task_prompt()),
    }
}
