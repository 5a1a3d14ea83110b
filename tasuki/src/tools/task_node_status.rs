//! Node status tracking tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::AgentContext;
use crate::error::ToolError;
use crate::message::ToolUse;
use crate::tool::{Tool, ToolResult};
use crate::workflow::{NodeKind, NodeStatus, WorkflowNode};

/// Marks workflow nodes done as the agent progresses through its plan.
///
/// Mutating the node tree re-numbers ids (dense pre-order), so the tool
/// reports the refreshed tree after every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskNodeStatusTool;

#[derive(Debug, Deserialize)]
struct NodeStatusArgs {
    #[serde(default)]
    completed_node_ids: Vec<u32>,
}

fn render_nodes(out: &mut String, nodes: &[WorkflowNode], depth: usize) {
    for node in nodes {
        let pad = "  ".repeat(depth);
        let marker = match node.status {
            NodeStatus::Done => "[done]",
            NodeStatus::Todo => "[todo]",
        };
        let label = match &node.kind {
            NodeKind::Step { text, .. } => text.clone(),
            NodeKind::ForEach { items, .. } => format!("forEach {items}"),
            NodeKind::Watch { event, .. } => format!("watch {event}"),
            NodeKind::HumanInteract { prompt } => format!("ask human: {prompt}"),
        };
        out.push_str(&format!("{pad}{} {marker} {label}\n", node.id));
        if let Some(children) = node.children() {
            render_nodes(out, children, depth + 1);
        }
    }
}

#[async_trait]
impl Tool for TaskNodeStatusTool {
    fn name(&self) -> &str {
        "task_node_status"
    }

    fn description(&self) -> String {
        "Mark plan nodes as completed. Pass the ids of every node you have \
         finished since the last call; the response shows the refreshed plan."
            .to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "completed_node_ids": {
                    "type": "array",
                    "items": {"type": "integer"},
                    "description": "Ids of nodes that are now done"
                }
            },
            "required": ["completed_node_ids"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        let args: NodeStatusArgs = serde_json::from_value(args)?;
        let agent_id = ctx.agent_chain().agent_id().to_owned();

        let outcome = ctx.task().with_workflow_mut(|workflow| {
            let index = workflow.agent_index(&agent_id)?;
            let agent = &mut workflow.agents[index];
            let marked = agent.mark_done(&args.completed_node_ids);
            let mut tree = String::new();
            render_nodes(&mut tree, &agent.nodes, 0);
            let next = agent.first_todo_node();
            workflow.refresh_xml();
            Some((marked, tree, next))
        });

        match outcome.flatten() {
            Some((marked, tree, next)) => {
                if let Some(node_id) = next {
                    ctx.set_current_node(node_id);
                }
                Ok(ToolResult::text(format!(
                    "Marked {marked} node(s) done. Current plan:\n{tree}"
                )))
            }
            None => Err(ToolError::Execution(
                "no workflow entry for this agent".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;
    use crate::workflow::{Workflow, WorkflowAgent};

    fn install_workflow(task: &std::sync::Arc<crate::context::TaskContext>) {
        let mut agent = WorkflowAgent {
            id: "task-1-000".into(),
            name: "Tester".into(),
            task: "do things".into(),
            depends_on: vec![],
            nodes: vec![
                WorkflowNode::step("first"),
                WorkflowNode::step("second"),
            ],
        };
        agent.renumber_nodes();
        task.set_workflow(Workflow::new("task-1", "p", "n", "t", vec![agent]));
    }

    #[tokio::test]
    async fn marks_nodes_and_reports_tree() {
        let task = test_support::task_context();
        let ctx = test_support::agent_context(&task);
        install_workflow(&task);

        let result = TaskNodeStatusTool
            .execute(
                serde_json::json!({"completed_node_ids": [1]}),
                &ctx,
                &ToolUse::new("c1", "task_node_status", Value::Null),
            )
            .await
            .unwrap();
        let text = result.first_text().unwrap();
        assert!(text.contains("Marked 1 node(s) done"));
        assert!(text.contains("[done] first"));
        assert!(text.contains("[todo] second"));
        assert_eq!(ctx.current_node(), Some(2));

        let workflow = task.workflow().unwrap();
        assert_eq!(workflow.agents[0].first_todo_node(), Some(2));
        assert!(workflow.xml.contains("status=\"done\""));
    }

    #[tokio::test]
    async fn missing_workflow_entry_fails() {
        let task = test_support::task_context();
        let ctx = test_support::agent_context(&task);
        // No workflow installed at all.
        let err = TaskNodeStatusTool
            .execute(
                serde_json::json!({"completed_node_ids": [1]}),
                &ctx,
                &ToolUse::new("c1", "task_node_status", Value::Null),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
