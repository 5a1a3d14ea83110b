//! Built-in tools the runtime itself provides to every agent.
//!
//! These cover the runtime's own concerns: cross-agent variable sharing,
//! human-in-the-loop suspensions, forEach iteration, node status tracking
//! and explicit result capture. Schema-only meta tools used for forced
//! judgment calls live in [`meta`].

mod foreach_task;
mod human_interact;
mod meta;
mod task_node_status;
mod task_result;
mod variable_storage;

pub use foreach_task::ForeachTaskTool;
pub use human_interact::HumanInteractTool;
pub use meta::{CheckTaskStatusTool, TodoListManagerTool};
pub use task_node_status::TaskNodeStatusTool;
pub use task_result::{TASK_RESULT_VARIABLE, TaskResultTool};
pub use variable_storage::VariableStorageTool;

use std::sync::Arc;

use crate::tool::Tool;

/// Tools that must never run concurrently with other calls in a batch.
pub const DEFAULT_SERIAL_TOOLS: &[&str] = &["human_interact", "variable_storage", "foreach_task"];

/// The built-in tools added to every agent's effective toolset.
#[must_use]
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(VariableStorageTool),
        Arc::new(HumanInteractTool),
        Arc::new(ForeachTaskTool),
        Arc::new(TaskNodeStatusTool),
        Arc::new(TaskResultTool),
    ]
}
