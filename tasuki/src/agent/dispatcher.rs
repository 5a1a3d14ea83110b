//! Tool dispatch for one LLM turn.
//!
//! Resolves each tool call against the agent's effective toolset, records
//! it on the chain, executes it under the agent context, and normalizes
//! every failure into `ToolResult { is_error: true }`. Result order always
//! matches call order, regardless of execution timing.

use serde_json::Value;
use tracing::{debug, warn};

use crate::callback::StreamMessage;
use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{ToolRegistry, ToolResult};

/// Outcome of dispatching one turn's tool calls.
#[derive(Debug)]
pub(crate) struct DispatchOutcome {
    /// Results in call order.
    pub results: Vec<(ToolUse, ToolResult)>,
    /// Whether every call in the batch failed.
    pub all_errored: bool,
}

/// Dispatch the calls of one turn per the agent's concurrency rules.
///
/// A batch runs concurrently only when the agent opted into parallel tool
/// calls and no call targets a serial-listed tool; otherwise the whole
/// batch runs sequentially in call order.
pub(crate) async fn dispatch_tool_calls(
    ctx: &AgentContext,
    registry: &ToolRegistry,
    calls: Vec<ToolUse>,
) -> DispatchOutcome {
    let has_serial = calls.iter().any(|c| ctx.agent().is_serial_tool(&c.name));
    let parallel = ctx.agent().parallel_tool_calls() && calls.len() > 1 && !has_serial;

    let results: Vec<(ToolUse, ToolResult)> = if parallel {
        debug!(count = calls.len(), "Dispatching tool calls concurrently");
        let futures: Vec<_> = calls
            .iter()
            .map(|call| execute_one(ctx, registry, call))
            .collect();
        let outcomes = futures::future::join_all(futures).await;
        calls.into_iter().zip(outcomes).collect()
    } else {
        let mut out = Vec::with_capacity(calls.len());
        for call in calls {
            let result = execute_one(ctx, registry, &call).await;
            out.push((call, result));
        }
        out
    };

    let all_errored = !results.is_empty() && results.iter().all(|(_, r)| r.is_error);
    DispatchOutcome {
        results,
        all_errored,
    }
}

/// Execute a single call: resolve, parse, record, run, normalize.
async fn execute_one(ctx: &AgentContext, registry: &ToolRegistry, call: &ToolUse) -> ToolResult {
    let chain_entry = ctx.agent_chain().add_tool(call);

    let Some(tool) = registry.get(&call.name) else {
        warn!(tool = %call.name, "Unknown tool requested by model");
        let result = ToolResult::error(format!(
            "Tool '{}' does not exist; available tools are listed in the request",
            call.name
        ));
        chain_entry.set_result(result.clone());
        emit_result(ctx, call, Value::Null, &result).await;
        return result;
    };

    let args = match call.resolved_arguments() {
        Ok(args) => args,
        Err(e) => {
            let result = ToolResult::error(format!("Invalid arguments: {e}"));
            chain_entry.set_result(result.clone());
            emit_result(ctx, call, Value::Null, &result).await;
            return result;
        }
    };
    chain_entry.set_params(args.clone());

    ctx.emit(StreamMessage::ToolUse {
        tool_name: call.name.clone(),
        tool_call_id: call.id.clone(),
        params: args.clone(),
    })
    .await;

    let signal = ctx.task().signal().clone();
    let execution = tool.execute(args.clone(), ctx, call);
    let outcome = tokio::select! {
        outcome = execution => outcome,
        () = signal.cancelled() => Err(ToolError::Aborted),
    };

    let result = match outcome {
        Ok(result) => result,
        Err(ToolError::Aborted) => ToolResult::error("Tool execution interrupted by abort"),
        Err(e) => {
            warn!(tool = %call.name, error = %e, "Tool failed");
            ToolResult::error(e.to_string())
        }
    };

    chain_entry.set_result(result.clone());
    emit_result(ctx, call, args, &result).await;
    result
}

async fn emit_result(ctx: &AgentContext, call: &ToolUse, params: Value, result: &ToolResult) {
    ctx.emit(StreamMessage::ToolResult {
        tool_name: call.name.clone(),
        tool_call_id: call.id.clone(),
        params,
        result: result.clone(),
    })
    .await;
}
