//! Workflow XML parsing and serialization.
//!
//! Two parsing modes share one code path: strict parsing for the final
//! planner output, and a tolerant mode that accepts any prefix of a
//! well-formed document by auto-closing open tags, so partial workflows can
//! be streamed to the callback while the planner is still emitting.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use super::{NodeKind, NodeStatus, Workflow, WorkflowAgent, WorkflowNode};
use crate::error::TaskError;

/// A parsed planner document, before ids are assigned.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParsedPlan {
    pub(crate) name: String,
    pub(crate) thought: String,
    pub(crate) agents: Vec<ParsedAgent>,
}

/// One parsed `<agent>` element, keeping the model-emitted id verbatim.
#[derive(Debug, Clone)]
pub(crate) struct ParsedAgent {
    pub(crate) name: String,
    pub(crate) emitted_id: Option<String>,
    pub(crate) depends_on: Vec<String>,
    pub(crate) task: String,
    pub(crate) nodes: Vec<WorkflowNode>,
}

// ---------------------------------------------------------------------------
// Generic element tree
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlNode>,
}

#[derive(Debug)]
enum XmlNode {
    Element(Element),
    Text(String),
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|c| match c {
            XmlNode::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(el) => Some(el),
            _ => None,
        })
    }

    fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlNode::Text(t) = child {
                out.push_str(t);
            }
        }
        out.trim().to_owned()
    }
}

/// Parse an XML document (or, in tolerant mode, any prefix of one) into an
/// element tree. Open elements are auto-closed at end of input.
fn parse_tree(xml: &str, tolerant: bool) -> Result<Element, TaskError> {
    let mut reader = Reader::from_str(xml);
    let config = reader.config_mut();
    config.expand_empty_elements = true;
    config.check_end_names = false;

    let mut stack: Vec<Element> = vec![Element {
        name: "#document".to_owned(),
        attrs: Vec::new(),
        children: Vec::new(),
    }];

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut attrs = Vec::new();
                for attr in start.attributes().with_checks(false).flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr
                        .unescape_value()
                        .map_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned(), |v| v.into_owned());
                    attrs.push((key, value));
                }
                stack.push(Element {
                    name,
                    attrs,
                    children: Vec::new(),
                });
            }
            Ok(Event::End(_)) => {
                if stack.len() > 1 {
                    let done = stack.pop().unwrap_or_default();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Element(done));
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_or_else(|_| String::from_utf8_lossy(text.as_ref()).into_owned(), |v| v.into_owned());
                if !value.trim().is_empty()
                    && let Some(parent) = stack.last_mut()
                {
                    parent.children.push(XmlNode::Text(value));
                }
            }
            Ok(Event::CData(data)) => {
                let value = String::from_utf8_lossy(data.as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::Text(value));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) if tolerant => {
                // A truncated tag at the end of a streaming prefix; keep
                // what parsed so far.
                tracing::debug!(error = %e, "Tolerant parse stopped at malformed tail");
                break;
            }
            Err(e) => {
                return Err(TaskError::WorkflowMalformed(e.to_string()));
            }
        }
    }

    // Auto-close whatever is still open.
    while stack.len() > 1 {
        let done = stack.pop().unwrap_or_default();
        if let Some(parent) = stack.last_mut() {
            parent.children.push(XmlNode::Element(done));
        }
    }
    stack.pop().ok_or_else(|| {
        TaskError::WorkflowMalformed("document stack underflow".to_owned())
    })
}

// ---------------------------------------------------------------------------
// Document -> plan mapping
// ---------------------------------------------------------------------------

/// Parse planner output into a [`ParsedPlan`].
///
/// In tolerant mode any prefix of a well-formed document is accepted; in
/// strict mode XML syntax errors fail with
/// [`TaskError::WorkflowMalformed`]. A document without agents parses into
/// an empty plan.
pub(crate) fn parse_workflow(xml: &str, tolerant: bool) -> Result<ParsedPlan, TaskError> {
    let document = parse_tree(xml, tolerant)?;
    let root = document
        .child("root")
        .unwrap_or(&document);

    let mut plan = ParsedPlan {
        name: root.child("name").map(Element::text).unwrap_or_default(),
        thought: root.child("thought").map(Element::text).unwrap_or_default(),
        agents: Vec::new(),
    };

    if let Some(agents) = root.child("agents") {
        for el in agents.child_elements() {
            if el.name != "agent" {
                continue;
            }
            let mut agent = ParsedAgent {
                name: el.attr("name").unwrap_or_default().to_owned(),
                emitted_id: el.attr("id").map(str::to_owned),
                depends_on: split_refs(el.attr("dependsOn").unwrap_or_default()),
                task: el.child("task").map(Element::text).unwrap_or_default(),
                nodes: el
                    .child("nodes")
                    .map(parse_node_list)
                    .unwrap_or_default(),
            };
            let mut next = 1;
            super::assign_node_ids(&mut agent.nodes, &mut next);
            plan.agents.push(agent);
        }
    }
    Ok(plan)
}

fn split_refs(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_node_list(parent: &Element) -> Vec<WorkflowNode> {
    parent
        .child_elements()
        .filter_map(parse_node_element)
        .collect()
}

fn known_attrs(kind: &str) -> &'static [&'static str] {
    match kind {
        "node" => &["id", "status", "input", "output"],
        "forEach" => &["id", "status", "items"],
        "watch" => &["id", "status", "event", "loop"],
        _ => &["id", "status"],
    }
}

fn parse_node_element(el: &Element) -> Option<WorkflowNode> {
    let kind = match el.name.as_str() {
        "node" => NodeKind::Step {
            text: el.text(),
            input: el.attr("input").map(str::to_owned),
            output: el.attr("output").map(str::to_owned),
        },
        "forEach" | "foreach" => NodeKind::ForEach {
            items: el.attr("items").unwrap_or_default().to_owned(),
            nodes: parse_node_list(el),
        },
        "watch" => NodeKind::Watch {
            event: el.attr("event").unwrap_or_default().to_owned(),
            r#loop: el
                .attr("loop")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            description: el
                .child("description")
                .map(Element::text)
                .unwrap_or_default(),
            trigger: el
                .child("trigger")
                .map(parse_node_list)
                .unwrap_or_default(),
        },
        "humanInteract" => NodeKind::HumanInteract { prompt: el.text() },
        _ => return None,
    };

    let known = known_attrs(&el.name);
    let extras: BTreeMap<String, String> = el
        .attrs
        .iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(WorkflowNode {
        id: el
            .attr("id")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        status: el.attr("status").map(NodeStatus::parse).unwrap_or_default(),
        kind,
        extras,
    })
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn push_extras(out: &mut String, extras: &BTreeMap<String, String>) {
    for (key, value) in extras {
        out.push_str(&format!(" {key}=\"{}\"", escape(value.as_str())));
    }
}

fn nodes_to_xml(out: &mut String, nodes: &[WorkflowNode], indent: usize) {
    let pad = "  ".repeat(indent);
    for node in nodes {
        match &node.kind {
            NodeKind::Step {
                text,
                input,
                output,
            } => {
                out.push_str(&format!(
                    "{pad}<node id=\"{}\" status=\"{}\"",
                    node.id,
                    node.status.as_str()
                ));
                if let Some(input) = input {
                    out.push_str(&format!(" input=\"{}\"", escape(input.as_str())));
                }
                if let Some(output) = output {
                    out.push_str(&format!(" output=\"{}\"", escape(output.as_str())));
                }
                push_extras(out, &node.extras);
                out.push_str(&format!(">{}</node>\n", escape(text.as_str())));
            }
            NodeKind::ForEach { items, nodes } => {
                out.push_str(&format!(
                    "{pad}<forEach id=\"{}\" status=\"{}\" items=\"{}\"",
                    node.id,
                    node.status.as_str(),
                    escape(items.as_str())
                ));
                push_extras(out, &node.extras);
                out.push_str(">\n");
                nodes_to_xml(out, nodes, indent + 1);
                out.push_str(&format!("{pad}</forEach>\n"));
            }
            NodeKind::Watch {
                event,
                r#loop,
                description,
                trigger,
            } => {
                out.push_str(&format!(
                    "{pad}<watch id=\"{}\" status=\"{}\" event=\"{}\" loop=\"{}\"",
                    node.id,
                    node.status.as_str(),
                    escape(event.as_str()),
                    r#loop
                ));
                push_extras(out, &node.extras);
                out.push_str(">\n");
                out.push_str(&format!(
                    "{pad}  <description>{}</description>\n",
                    escape(description.as_str())
                ));
                out.push_str(&format!("{pad}  <trigger>\n"));
                nodes_to_xml(out, trigger, indent + 2);
                out.push_str(&format!("{pad}  </trigger>\n"));
                out.push_str(&format!("{pad}</watch>\n"));
            }
            NodeKind::HumanInteract { prompt } => {
                out.push_str(&format!(
                    "{pad}<humanInteract id=\"{}\" status=\"{}\"",
                    node.id,
                    node.status.as_str()
                ));
                push_extras(out, &node.extras);
                out.push_str(&format!(">{}</humanInteract>\n", escape(prompt.as_str())));
            }
        }
    }
}

/// Serialize one agent element.
pub(crate) fn agent_to_xml(agent: &WorkflowAgent) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "  <agent name=\"{}\" id=\"{}\"",
        escape(agent.name.as_str()),
        escape(agent.id.as_str())
    ));
    if !agent.depends_on.is_empty() {
        out.push_str(&format!(
            " dependsOn=\"{}\"",
            escape(agent.depends_on.join(",").as_str())
        ));
    }
    out.push_str(">\n");
    out.push_str(&format!("    <task>{}</task>\n", escape(agent.task.as_str())));
    out.push_str("    <nodes>\n");
    nodes_to_xml(&mut out, &agent.nodes, 3);
    out.push_str("    </nodes>\n");
    out.push_str("  </agent>\n");
    out
}

/// Serialize a full workflow document.
pub(crate) fn workflow_to_xml(workflow: &Workflow) -> String {
    let mut out = String::new();
    out.push_str("<root>\n");
    out.push_str(&format!("<name>{}</name>\n", escape(workflow.name.as_str())));
    out.push_str(&format!(
        "<thought>{}</thought>\n",
        escape(workflow.thought.as_str())
    ));
    out.push_str("<agents>\n");
    for agent in &workflow.agents {
        out.push_str(&agent.to_xml());
    }
    out.push_str("</agents>\n");
    out.push_str("</root>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DOC: &str = r#"<root>
<name>Fetch and save</name>
<thought>Two agents are needed.</thought>
<agents>
  <agent name="Browser" id="0">
    <task>Fetch the title of example.com</task>
    <nodes>
      <node input="url">open example.com</node>
      <node output="title">extract the title</node>
      <watch event="dom" loop="false">
        <description>wait for the page to settle</description>
        <trigger>
          <node>re-extract the title</node>
        </trigger>
      </watch>
    </nodes>
  </agent>
  <agent name="File" id="1" dependsOn="0">
    <task>Save the title to /tmp/t.txt</task>
    <nodes>
      <forEach items="title">
        <node>write one line</node>
      </forEach>
      <humanInteract>confirm overwrite</humanInteract>
    </nodes>
  </agent>
</agents>
</root>"#;

    #[test]
    fn parses_full_document() {
        let plan = parse_workflow(FULL_DOC, false).unwrap();
        assert_eq!(plan.name, "Fetch and save");
        assert_eq!(plan.thought, "Two agents are needed.");
        assert_eq!(plan.agents.len(), 2);

        let browser = &plan.agents[0];
        assert_eq!(browser.name, "Browser");
        assert_eq!(browser.emitted_id.as_deref(), Some("0"));
        assert!(browser.depends_on.is_empty());
        assert_eq!(browser.nodes.len(), 3);
        assert!(matches!(
            &browser.nodes[2].kind,
            NodeKind::Watch { event, r#loop: false, .. } if event == "dom"
        ));

        let file = &plan.agents[1];
        assert_eq!(file.depends_on, vec!["0"]);
        assert!(matches!(
            &file.nodes[0].kind,
            NodeKind::ForEach { items, .. } if items == "title"
        ));
        assert!(matches!(
            &file.nodes[1].kind,
            NodeKind::HumanInteract { prompt } if prompt == "confirm overwrite"
        ));
    }

    #[test]
    fn node_ids_assigned_dense_pre_order() {
        let plan = parse_workflow(FULL_DOC, false).unwrap();
        let browser = &plan.agents[0];
        // node, node, watch, trigger-node
        let ids: Vec<u32> = {
            let mut out = Vec::new();
            super::super::collect_ids(&browser.nodes, &mut out);
            out
        };
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn tolerant_parse_accepts_any_prefix() {
        // Every prefix must parse without error and never panic.
        for len in 0..FULL_DOC.len() {
            let prefix = &FULL_DOC[..len];
            if !prefix.is_char_boundary(len) {
                continue;
            }
            let plan = parse_workflow(prefix, true).unwrap();
            assert!(plan.agents.len() <= 2);
        }
    }

    #[test]
    fn tolerant_parse_of_truncated_agent_keeps_parsed_content() {
        let cut = FULL_DOC.find("<agent name=\"File\"").unwrap();
        let plan = parse_workflow(&FULL_DOC[..cut], true).unwrap();
        assert_eq!(plan.name, "Fetch and save");
        assert_eq!(plan.agents.len(), 1);
        assert_eq!(plan.agents[0].name, "Browser");
    }

    #[test]
    fn strict_parse_rejects_malformed_xml() {
        let err = parse_workflow("<root><name>x</wrong></name></root>", false);
        // Either a reader error or a tree that simply misses agents is
        // acceptable for nonsense input, but truncated tags must error.
        let err2 = parse_workflow("<root><agents><agent na", false);
        assert!(err.is_err() || err2.is_err());
    }

    #[test]
    fn empty_input_parses_to_empty_plan() {
        let plan = parse_workflow("", false).unwrap();
        assert!(plan.agents.is_empty());
        assert!(plan.name.is_empty());
    }

    #[test]
    fn extra_attributes_are_preserved() {
        let doc = r#"<root><agents><agent name="A" id="0"><task>t</task><nodes>
            <node priority="high" retry="2">do it</node>
        </nodes></agent></agents></root>"#;
        let plan = parse_workflow(doc, false).unwrap();
        let node = &plan.agents[0].nodes[0];
        assert_eq!(node.extras.get("priority").map(String::as_str), Some("high"));
        assert_eq!(node.extras.get("retry").map(String::as_str), Some("2"));
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let plan = parse_workflow(FULL_DOC, false).unwrap();
        let agents: Vec<WorkflowAgent> = plan
            .agents
            .iter()
            .enumerate()
            .map(|(i, parsed)| WorkflowAgent {
                id: format!("t-{i:03}"),
                name: parsed.name.clone(),
                task: parsed.task.clone(),
                depends_on: if i == 0 { vec![] } else { vec!["t-000".into()] },
                nodes: parsed.nodes.clone(),
            })
            .collect();
        let workflow = Workflow::new("t", "prompt", plan.name, plan.thought, agents);

        let reparsed = parse_workflow(&workflow.xml, false).unwrap();
        assert_eq!(reparsed.name, workflow.name);
        assert_eq!(reparsed.agents.len(), workflow.agents.len());
        for (parsed, original) in reparsed.agents.iter().zip(&workflow.agents) {
            assert_eq!(parsed.emitted_id.as_deref(), Some(original.id.as_str()));
            assert_eq!(parsed.task, original.task);
            assert_eq!(parsed.nodes, original.nodes);
        }
        assert_eq!(reparsed.agents[1].depends_on, vec!["t-000"]);
    }

    #[test]
    fn escaped_content_survives_round_trip() {
        let mut agent = WorkflowAgent {
            id: "t-000".into(),
            name: "A & B".into(),
            task: "compare <a> with \"b\"".into(),
            depends_on: vec![],
            nodes: vec![WorkflowNode::step("check x < y && y > z")],
        };
        agent.renumber_nodes();
        let workflow = Workflow::new("t", "p", "n", "th", vec![agent]);
        let reparsed = parse_workflow(&workflow.xml, false).unwrap();
        assert_eq!(reparsed.agents[0].name, "A & B");
        assert_eq!(reparsed.agents[0].task, "compare <a> with \"b\"");
        assert!(matches!(
            &reparsed.agents[0].nodes[0].kind,
            NodeKind::Step { text, .. } if text == "check x < y && y > z"
        ));
    }
}
