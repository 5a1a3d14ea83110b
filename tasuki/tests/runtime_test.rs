//! End-to-end tests for the task runtime, driven by the scripted mock
//! provider. No network access.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tasuki::llm::MockProvider;
use tasuki::prelude::*;

/// Records every streamed payload for assertions.
#[derive(Default)]
struct RecordingCallback {
    payloads: Mutex<Vec<StreamPayload>>,
}

impl RecordingCallback {
    fn task_id(&self) -> Option<String> {
        self.payloads
            .lock()
            .unwrap()
            .first()
            .map(|p| p.task_id.clone())
    }

    fn messages(&self) -> Vec<StreamMessage> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.message.clone())
            .collect()
    }

    fn message_types(&self) -> Vec<String> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                serde_json::to_value(&p.message).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_owned()
            })
            .collect()
    }
}

#[async_trait]
impl TaskCallback for RecordingCallback {
    async fn on_message(&self, payload: &StreamPayload) {
        self.payloads.lock().unwrap().push(payload.clone());
    }
}

/// A file-write tool backed by an in-memory map.
struct FileWriteTool {
    files: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> String {
        "Write content to a file path".to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        _ctx: &AgentContext,
        _call: &ToolUse,
    ) -> std::result::Result<ToolResult, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("path must be a string".into()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("content must be a string".into()))?;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_owned(), content.to_owned());
        Ok(ToolResult::text(format!("wrote {path}")))
    }
}

/// A tool that sleeps far longer than any test timeout.
struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "long_sleep"
    }

    fn description(&self) -> String {
        "Sleeps for ten seconds".to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(
        &self,
        _args: Value,
        _ctx: &AgentContext,
        _call: &ToolUse,
    ) -> std::result::Result<ToolResult, ToolError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ToolResult::text("slept"))
    }
}

/// A tool that always throws.
struct ThrowingTool;

#[async_trait]
impl Tool for ThrowingTool {
    fn name(&self) -> &str {
        "always_throws"
    }

    fn description(&self) -> String {
        "Fails unconditionally".to_owned()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(
        &self,
        _args: Value,
        _ctx: &AgentContext,
        _call: &ToolUse,
    ) -> std::result::Result<ToolResult, ToolError> {
        Err(ToolError::Execution("tool exploded".into()))
    }
}

fn plan_xml(body: &str) -> String {
    format!("<root>\n<name>test plan</name>\n<thought>scripted</thought>\n<agents>\n{body}\n</agents>\n</root>")
}

#[tokio::test]
async fn single_agent_happy_path() {
    let files = Arc::new(Mutex::new(HashMap::new()));
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="File" id="0"><task>Write hello to /tmp/a.txt</task><nodes><node>write the file</node></nodes></agent>"#,
    ));
    provider.push_tool_call(
        "file_write",
        serde_json::json!({"path": "/tmp/a.txt", "content": "hello"}),
    );
    provider.push_text("done");

    let callback = Arc::new(RecordingCallback::default());
    let config = Config::builder()
        .llm("default", provider)
        .agent(
            Agent::builder("File")
                .description("writes files")
                .tool(Arc::new(FileWriteTool {
                    files: Arc::clone(&files),
                }))
                .build(),
        )
        .callback(Arc::clone(&callback) as Arc<dyn TaskCallback>)
        .build()
        .unwrap();

    let outcome = TaskRuntime::new(config)
        .run("Write 'hello' to /tmp/a.txt")
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.result.contains("done"));
    assert_eq!(
        files.lock().unwrap().get("/tmp/a.txt").map(String::as_str),
        Some("hello")
    );

    // Chain integrity: one agent chain, one tool chain, exact params.
    let agents = outcome.chain.agents();
    assert_eq!(agents.len(), 1);
    let tools = agents[0].tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].tool_name(), "file_write");
    assert_eq!(
        tools[0].params().unwrap(),
        serde_json::json!({"path": "/tmp/a.txt", "content": "hello"})
    );
    assert!(!tools[0].result().unwrap().is_error);

    // Stream framing: starts with workflow_start, ends with workflow_end.
    let types = callback.message_types();
    assert_eq!(types.first().unwrap(), "workflow_start");
    assert_eq!(types.last().unwrap(), "workflow_end");
    assert!(types.contains(&"workflow".to_owned()));
    assert!(types.contains(&"tool_use".to_owned()));
    assert!(types.contains(&"tool_result".to_owned()));
    assert!(types.contains(&"finish".to_owned()));
}

#[tokio::test]
async fn two_agent_dependency_passes_data_through_variables() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="Browser" id="0"><task>Fetch the title</task><nodes><node output="title">extract</node></nodes></agent>
<agent name="File" id="1" dependsOn="0"><task>Save the title</task><nodes><node input="title">save</node></nodes></agent>"#,
    ));
    // Browser: publish the title, then finish.
    provider.push_tool_call(
        "variable_storage",
        serde_json::json!({"action": "set", "key": "title", "value": "Example Domain"}),
    );
    provider.push_text("title stored");
    // File: read the variable, then finish.
    provider.push_tool_call(
        "variable_storage",
        serde_json::json!({"action": "get", "key": "title"}),
    );
    provider.push_text("saved the title");

    let config = Config::builder()
        .llm("default", provider)
        .agent(Agent::new("Browser", "fetches pages"))
        .agent(Agent::new("File", "writes files"))
        .build()
        .unwrap();

    let outcome = TaskRuntime::new(config)
        .run("Fetch example.com title and save it")
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.result, "saved the title");

    // Scheduler respected the dependency: Browser's chain precedes File's.
    let agents = outcome.chain.agents();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].agent_name(), "Browser");
    assert_eq!(agents[1].agent_name(), "File");
    assert_eq!(agents[0].result().as_deref(), Some("title stored"));

    // File's read observed the value Browser stored.
    let file_tools = agents[1].tools();
    assert_eq!(file_tools.len(), 1);
    assert!(
        file_tools[0]
            .result()
            .unwrap()
            .first_text()
            .unwrap()
            .contains("Example Domain")
    );
}

#[tokio::test]
async fn parallel_independent_agents_both_complete() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="A" id="0"><task>left half</task><nodes><node>go</node></nodes></agent>
<agent name="B" id="1"><task>right half</task><nodes><node>go</node></nodes></agent>"#,
    ));
    provider.push_text("done");
    provider.push_text("done");

    let callback = Arc::new(RecordingCallback::default());
    let config = Config::builder()
        .llm("default", provider)
        .agent(Agent::new("A", "left"))
        .agent(Agent::new("B", "right"))
        .callback(Arc::clone(&callback) as Arc<dyn TaskCallback>)
        .build()
        .unwrap();

    let outcome = TaskRuntime::new(config).run("split the work").await.unwrap();

    assert!(outcome.success);
    let agents = outcome.chain.agents();
    assert_eq!(agents.len(), 2);
    for agent in &agents {
        assert_eq!(agent.result().as_deref(), Some("done"));
    }

    // Both agents emitted finish events.
    let finishes = callback
        .messages()
        .iter()
        .filter(|m| matches!(m, StreamMessage::Finish { success: true, .. }))
        .count();
    assert_eq!(finishes, 2);
}

#[tokio::test]
async fn replan_mid_flight_splices_suffix() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="P1" id="0"><task>start</task><nodes><node>s</node></nodes></agent>
<agent name="P2" id="1" dependsOn="0"><task>old second</task><nodes><node>s</node></nodes></agent>
<agent name="P3" id="2" dependsOn="1"><task>old third</task><nodes><node>s</node></nodes></agent>"#,
    ));
    // P1 turn 1: a tool call, so the replan hook fires after the turn.
    provider.push_tool_call(
        "variable_storage",
        serde_json::json!({"action": "set", "key": "k", "value": 1}),
    );
    // Judge: replan.
    provider.push_tool_call("check_task_status", serde_json::json!({"replan": true}));
    // Suffix rewrite.
    provider.push_text(plan_xml(
        r#"<agent name="P2x" id="0"><task>new second</task><nodes><node>s</node></nodes></agent>
<agent name="P3x" id="1" dependsOn="0"><task>new third</task><nodes><node>s</node></nodes></agent>
<agent name="P4x" id="2" dependsOn="1"><task>new fourth</task><nodes><node>s</node></nodes></agent>"#,
    ));
    // P1 turn 2: finish. The spliced agents then run on default turns.
    provider.push_text("p1 done");

    let config = Config::builder()
        .llm("default", provider)
        .agent(
            Agent::builder("P1")
                .description("first")
                .replan_after_turns(1)
                .build(),
        )
        .agent(Agent::new("P2", "old second"))
        .agent(Agent::new("P3", "old third"))
        .agent(Agent::new("P2x", "new second"))
        .agent(Agent::new("P3x", "new third"))
        .agent(Agent::new("P4x", "new fourth"))
        .build()
        .unwrap();

    let outcome = TaskRuntime::new(config).run("shifting task").await.unwrap();
    assert!(outcome.success, "errors: {:?}", outcome.errors);

    let workflow = outcome.workflow.unwrap();
    let task_id = outcome.chain.task_id();
    assert!(workflow.modified);
    assert_eq!(workflow.agents.len(), 4);
    assert_eq!(workflow.agents[0].name, "P1");
    assert_eq!(workflow.agents[1].name, "P2x");
    assert_eq!(workflow.agents[1].id, format!("{task_id}-001"));
    assert_eq!(
        workflow.agents[1].depends_on,
        vec![format!("{task_id}-000")]
    );
    assert_eq!(workflow.agents[3].id, format!("{task_id}-003"));

    // P1's chain entry survived the splice untouched.
    let p1_chain = outcome.chain.agent_by_id(&format!("{task_id}-000")).unwrap();
    assert_eq!(p1_chain.result().as_deref(), Some("p1 done"));
    assert_eq!(p1_chain.tools().len(), 1);

    // All four agents ran.
    assert_eq!(outcome.chain.agents().len(), 4);
}

#[tokio::test]
async fn abort_during_tool_call_interrupts_quickly() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="Sleeper" id="0"><task>sleep</task><nodes><node>sleep</node></nodes></agent>
<agent name="Never" id="1" dependsOn="0"><task>never runs</task><nodes><node>x</node></nodes></agent>"#,
    ));
    provider.push_tool_call("long_sleep", serde_json::json!({}));

    let callback = Arc::new(RecordingCallback::default());
    let config = Config::builder()
        .llm("default", provider)
        .agent(
            Agent::builder("Sleeper")
                .description("sleeps")
                .tool(Arc::new(SleepTool))
                .build(),
        )
        .agent(Agent::new("Never", "unreachable"))
        .callback(Arc::clone(&callback) as Arc<dyn TaskCallback>)
        .build()
        .unwrap();

    let runtime = TaskRuntime::new(config);
    let run = tokio::spawn(async move { runtime.run("sleep forever").await });

    // Let the tool start, then abort through the registry handle. The task
    // id comes from the stream payloads, so concurrent tests cannot
    // interfere with the lookup.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let task_id = callback.task_id().expect("no payloads streamed yet");
    let handle = TaskRuntime::task_handle(&task_id).unwrap();
    let aborted_at = std::time::Instant::now();
    handle.abort(Some("test abort".into()));

    let outcome = run.await.unwrap();
    assert!(aborted_at.elapsed() < Duration::from_millis(500));
    let err = outcome.unwrap_err();
    assert!(err.is_aborted());

    // The interrupted tool reported an error result mentioning the abort.
    let tool_results: Vec<_> = callback
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            StreamMessage::ToolResult { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(tool_results.len(), 1);
    assert!(tool_results[0].is_error);
    assert!(
        tool_results[0]
            .first_text()
            .unwrap()
            .to_lowercase()
            .contains("interrupted")
    );

    // The registry no longer lists this task.
    assert!(TaskRuntime::task_handle(&task_id).is_none());
}

#[tokio::test]
async fn consecutive_tool_failures_fail_the_task() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="Doomed" id="0"><task>try anyway</task><nodes><node>try</node></nodes></agent>"#,
    ));
    for _ in 0..3 {
        provider.push_tool_call("always_throws", serde_json::json!({}));
    }

    let callback = Arc::new(RecordingCallback::default());
    let config = Config::builder()
        .llm("default", provider)
        .agent(
            Agent::builder("Doomed")
                .description("uses a broken tool")
                .tool(Arc::new(ThrowingTool))
                .build(),
        )
        .callback(Arc::clone(&callback) as Arc<dyn TaskCallback>)
        .build()
        .unwrap();

    let outcome = TaskRuntime::new(config).run("doomed task").await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("3 consecutive error turns"));

    // Terminal finish with failure metadata was streamed.
    let finish = callback
        .messages()
        .into_iter()
        .rev()
        .find_map(|m| match m {
            StreamMessage::Finish { success, .. } => Some(success),
            _ => None,
        });
    assert_eq!(finish, Some(false));

    // Partial chain still returned: the agent and its three failed calls.
    let agents = outcome.chain.agents();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].tools().len(), 3);
    assert!(agents[0].tools().iter().all(|t| t.result().unwrap().is_error));
}

#[tokio::test]
async fn empty_plan_means_nothing_to_do() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text("<root><name>empty</name><agents></agents></root>");
    let config = Config::builder()
        .llm("default", provider)
        .agent(Agent::new("Idle", "never used"))
        .build()
        .unwrap();

    let outcome = TaskRuntime::new(config).run("").await.unwrap();
    assert!(outcome.success);
    assert!(outcome.result.is_empty());
    assert!(outcome.chain.agents().is_empty());
    assert!(outcome.workflow.unwrap().agents.is_empty());
}

#[tokio::test]
async fn pause_and_resume_through_the_handle() {
    let provider = Arc::new(MockProvider::new());
    provider.push_text(plan_xml(
        r#"<agent name="Solo" id="0"><task>answer</task><nodes><node>a</node></nodes></agent>"#,
    ));
    provider.push_tool_call(
        "variable_storage",
        serde_json::json!({"action": "set", "key": "x", "value": 1}),
    );
    provider.push_text("finished");

    let callback = Arc::new(RecordingCallback::default());
    let config = Config::builder()
        .llm("default", provider)
        .agent(Agent::new("Solo", "answers"))
        .callback(Arc::clone(&callback) as Arc<dyn TaskCallback>)
        .build()
        .unwrap();
    let runtime = TaskRuntime::new(config);
    let run = tokio::spawn(async move { runtime.run("pausable").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Some(handle) = callback
        .task_id()
        .and_then(|id| TaskRuntime::task_handle(&id))
    {
        handle.pause();
        assert!(handle.is_paused());
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.resume();
    }

    let outcome = run.await.unwrap().unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.result, "finished");
}
