//! Workflow model: the tree of agents and per-agent node plans.
//!
//! A [`Workflow`] is produced by the planner, read by the scheduler and
//! every agent context, and mutated only by the replanner (which replaces
//! the unexecuted suffix and sets [`Workflow::modified`]).

mod xml;

pub(crate) use xml::{ParsedPlan, parse_workflow};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Execution status of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet executed.
    #[default]
    Todo,
    /// Completed.
    Done,
}

impl NodeStatus {
    /// The XML attribute value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Done => "done",
        }
    }

    /// Parse an XML attribute value; anything but `done` is `todo`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("done") {
            Self::Done
        } else {
            Self::Todo
        }
    }
}

/// The kind-specific payload of a workflow node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// An atomic step with optional variable read/write hints.
    Step {
        /// The step instruction text.
        text: String,
        /// Variable the step reads, if declared.
        input: Option<String>,
        /// Variable the step writes, if declared.
        output: Option<String>,
    },
    /// An iterative section over a list literal or variable name.
    ForEach {
        /// The list literal or variable name.
        items: String,
        /// The loop body.
        nodes: Vec<WorkflowNode>,
    },
    /// A reactive section fired on an external event.
    Watch {
        /// Event source (e.g., "dom").
        event: String,
        /// Whether the watch keeps firing after the first trigger.
        r#loop: bool,
        /// Human-readable description of the condition.
        description: String,
        /// Nodes executed when the watch fires.
        trigger: Vec<WorkflowNode>,
    },
    /// A suspension requesting confirmation or input from the human.
    HumanInteract {
        /// The prompt shown to the human.
        prompt: String,
    },
}

/// A node in an agent's plan tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Dense pre-order id, starting at 1 within the agent.
    pub id: u32,
    /// Execution status.
    pub status: NodeStatus,
    /// Kind-specific payload.
    pub kind: NodeKind,
    /// Unrecognized XML attributes, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
}

impl WorkflowNode {
    /// Create a plain step node (id assigned later).
    #[must_use]
    pub fn step(text: impl Into<String>) -> Self {
        Self {
            id: 0,
            status: NodeStatus::Todo,
            kind: NodeKind::Step {
                text: text.into(),
                input: None,
                output: None,
            },
            extras: BTreeMap::new(),
        }
    }

    /// Child node list, if this kind has one.
    #[must_use]
    pub fn children(&self) -> Option<&Vec<WorkflowNode>> {
        match &self.kind {
            NodeKind::ForEach { nodes, .. } => Some(nodes),
            NodeKind::Watch { trigger, .. } => Some(trigger),
            _ => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<WorkflowNode>> {
        match &mut self.kind {
            NodeKind::ForEach { nodes, .. } => Some(nodes),
            NodeKind::Watch { trigger, .. } => Some(trigger),
            _ => None,
        }
    }
}

/// Assign dense pre-order ids starting from `next`.
pub(crate) fn assign_node_ids(nodes: &mut [WorkflowNode], next: &mut u32) {
    for node in nodes {
        node.id = *next;
        *next += 1;
        if let Some(children) = node.children_mut() {
            assign_node_ids(children, next);
        }
    }
}

fn mark_nodes_done(nodes: &mut [WorkflowNode], ids: &[u32]) -> usize {
    let mut marked = 0;
    for node in nodes {
        if ids.contains(&node.id) && node.status != NodeStatus::Done {
            node.status = NodeStatus::Done;
            marked += 1;
        }
        if let Some(children) = node.children_mut() {
            marked += mark_nodes_done(children, ids);
        }
    }
    marked
}

fn collect_ids(nodes: &[WorkflowNode], out: &mut Vec<u32>) {
    for node in nodes {
        out.push(node.id);
        if let Some(children) = node.children() {
            collect_ids(children, out);
        }
    }
}

fn first_todo(nodes: &[WorkflowNode]) -> Option<u32> {
    for node in nodes {
        if node.status == NodeStatus::Todo {
            return Some(node.id);
        }
        if let Some(children) = node.children()
            && let Some(id) = first_todo(children)
        {
            return Some(id);
        }
    }
    None
}

/// One agent's entry in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAgent {
    /// Stable id: `{taskId}-{zero-padded index}`.
    pub id: String,
    /// The registered agent name this entry schedules.
    pub name: String,
    /// The task text assigned to the agent.
    pub task: String,
    /// Ids of agents that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// The agent's plan tree.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
}

impl WorkflowAgent {
    /// Re-assign dense pre-order node ids starting at 1.
    pub fn renumber_nodes(&mut self) {
        let mut next = 1;
        assign_node_ids(&mut self.nodes, &mut next);
    }

    /// Mark the given node ids done, then renumber; returns how many nodes
    /// changed status.
    pub fn mark_done(&mut self, ids: &[u32]) -> usize {
        let marked = mark_nodes_done(&mut self.nodes, ids);
        self.renumber_nodes();
        marked
    }

    /// All node ids in pre-order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<u32> {
        let mut out = Vec::new();
        collect_ids(&self.nodes, &mut out);
        out
    }

    /// The first node still marked todo, in pre-order.
    #[must_use]
    pub fn first_todo_node(&self) -> Option<u32> {
        first_todo(&self.nodes)
    }

    /// Serialize this agent subtree to XML.
    #[must_use]
    pub fn to_xml(&self) -> String {
        xml::agent_to_xml(self)
    }
}

/// A named, immutable-after-plan workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Id of the owning task.
    pub task_id: String,
    /// Workflow display name.
    pub name: String,
    /// The planner's reasoning summary.
    pub thought: String,
    /// The original task prompt.
    pub task_prompt: String,
    /// Agents in plan order.
    pub agents: Vec<WorkflowAgent>,
    /// Serialized XML form, kept in sync by [`Workflow::refresh_xml`].
    pub xml: String,
    /// Set by the replanner after a suffix splice.
    #[serde(default)]
    pub modified: bool,
}

impl Workflow {
    /// Create a workflow and compute its XML form.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        task_prompt: impl Into<String>,
        name: impl Into<String>,
        thought: impl Into<String>,
        agents: Vec<WorkflowAgent>,
    ) -> Self {
        let mut workflow = Self {
            task_id: task_id.into(),
            name: name.into(),
            thought: thought.into(),
            task_prompt: task_prompt.into(),
            agents,
            xml: String::new(),
            modified: false,
        };
        workflow.refresh_xml();
        workflow
    }

    /// Look up an agent entry by id.
    #[must_use]
    pub fn agent_by_id(&self, id: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Index of an agent entry by id.
    #[must_use]
    pub fn agent_index(&self, id: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.id == id)
    }

    /// Serialize the workflow to XML.
    #[must_use]
    pub fn to_xml(&self) -> String {
        xml::workflow_to_xml(self)
    }

    /// Recompute the cached XML form after a mutation.
    pub fn refresh_xml(&mut self) {
        self.xml = self.to_xml();
    }
}
