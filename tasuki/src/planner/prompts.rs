//! Prompt composition for planning calls.

use std::sync::Arc;

use crate::agent::Agent;

/// System prompt listing the registered agents and the output grammar.
pub(crate) fn plan_system_prompt(agents: &[Arc<Agent>]) -> String {
    let mut roster = String::new();
    for agent in agents {
        roster.push_str(&format!(
            "- {}: {}\n",
            agent.name(),
            agent.plan_description()
        ));
        let tools = agent.planning_tool_names();
        if !tools.is_empty() {
            roster.push_str(&format!("  tools: {}\n", tools.join(", ")));
        }
    }
    if roster.is_empty() {
        roster.push_str("(no agents registered)\n");
    }

    format!(
        r#"You are the task planner of a multi-agent runtime. Decompose the
user's task into a workflow of the available agents.

## Available agents
{roster}
## Output format
Respond with XML only, no prose before or after:

<root>
<name>short workflow name</name>
<thought>one paragraph explaining the decomposition</thought>
<agents>
  <agent name="AgentName" id="0" dependsOn="">
    <task>what this agent must achieve</task>
    <nodes>
      <node>one concrete step</node>
      <node input="varRead" output="varWritten">a step using variables</node>
      <forEach items="listVariableOrInlineList">
        <node>step executed per item</node>
      </forEach>
      <watch event="dom" loop="false">
        <description>condition to watch for</description>
        <trigger>
          <node>reaction step</node>
        </trigger>
      </watch>
      <humanInteract>question requiring the human</humanInteract>
    </nodes>
  </agent>
</agents>
</root>

Rules:
- Use only the listed agents, by exact name. An agent may appear more than
  once with different tasks.
- Number agents with id="0", id="1", ... in emission order.
- dependsOn is a comma-separated list of ids of agents whose results this
  agent needs; leave it empty for independent agents.
- Mark variables a step reads with input="name" and writes with
  output="name"; later agents read them through variable storage.
- Emit no agents at all when the task requires no work."#
    )
}

/// User prompt embedding the task text and the datetime.
pub(crate) fn plan_user_prompt(task_prompt: &str, datetime: &str) -> String {
    format!("Current datetime: {datetime}\n\nTask:\n{task_prompt}\n\nPlan the workflow now.")
}

/// Instruction appended when regenerating the unexecuted suffix.
pub(crate) fn replan_suffix_instruction(executed: &[(String, Option<String>)]) -> String {
    let mut summary = String::new();
    for (label, result) in executed {
        match result {
            Some(result) => summary.push_str(&format!("- {label}: finished. Result: {result}\n")),
            None => summary.push_str(&format!("- {label}: currently executing\n")),
        }
    }
    format!(
        "The task is partially executed and the remaining plan is no longer \
         valid. Agents executed so far:\n{summary}\n\
         Re-plan ONLY the remaining work as a fresh <root> document. Do not \
         re-emit the executed agents or their nodes; the new agents may read \
         the variables the executed agents stored. Number the new agents \
         from id=\"0\" again."
    )
}

/// Status summary plus the judge question for the replan check.
pub(crate) fn judge_user_prompt(status_summary: &str) -> String {
    format!(
        "Current execution status:\n{status_summary}\n\
         Given these results, judge whether the remaining plan is still the \
         right way to finish the task. Call check_task_status with your \
         verdict."
    )
}
