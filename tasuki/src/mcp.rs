//! Tool-discovery (MCP) integration.
//!
//! The runtime consumes MCP servers through the [`McpService`] trait;
//! discovered declarations are wrapped into [`McpTool`] adapters and merged
//! into an agent's effective toolset. A concrete `rmcp`-backed client is
//! available behind the `rmcp` cargo feature.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::{AbortSignal, AgentContext};
use crate::error::ToolError;
use crate::message::{LlmMessage, ToolUse};
use crate::tool::{Tool, ToolResult};

/// Errors from MCP connections and calls.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum McpError {
    /// Could not establish the connection.
    #[error("mcp connection failed: {0}")]
    Connection(String),

    /// The service is not connected.
    #[error("mcp service is not connected")]
    NotConnected,

    /// Listing tools failed.
    #[error("mcp list_tools failed: {0}")]
    ListTools(String),

    /// A tool call failed on the server side.
    #[error("mcp call_tool '{name}' failed: {message}")]
    CallTool {
        /// Tool name.
        name: String,
        /// Error description.
        message: String,
    },
}

/// A tool declaration returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDecl {
    /// Tool name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema for the tool's input.
    pub input_schema: Value,
}

/// Parameters for tool discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpListToolsParams {
    /// The environment label (e.g., "browser", "desktop").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Name of the requesting agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// The task prompt, for relevance filtering on the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Additional server-specific parameters.
    #[serde(default, flatten)]
    pub extras: serde_json::Map<String, Value>,
}

/// Parameters for a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallToolParams {
    /// Tool name.
    pub name: String,
    /// Structured arguments.
    pub arguments: Value,
    /// Extra info forwarded to the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_info: Option<serde_json::Map<String, Value>>,
}

/// Decision returned by an agent's per-turn discovery hook.
#[derive(Debug, Clone, Default)]
pub struct McpControl {
    /// Re-run discovery before the next turn.
    pub refresh: bool,
    /// Extra parameters merged into the discovery request.
    pub params: serde_json::Map<String, Value>,
}

impl McpControl {
    /// Request a refresh with extra discovery parameters.
    #[must_use]
    pub const fn refresh_with(params: serde_json::Map<String, Value>) -> Self {
        Self {
            refresh: true,
            params,
        }
    }
}

/// Hook deciding whether discovered tools are stale for the coming turn.
///
/// Agents with fast-changing contexts (e.g., browsers after navigation)
/// return `refresh: true` so the dispatcher re-discovers instead of reusing
/// a toolset cached for a previous page.
pub type McpControlHook = Arc<dyn Fn(usize, &[LlmMessage]) -> McpControl + Send + Sync>;

/// The interface to an MCP server, transport-agnostic.
#[async_trait]
pub trait McpService: Send + Sync {
    /// Establish the connection, observing the abort signal.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Connection`] on failure.
    async fn connect(&self, signal: &AbortSignal) -> Result<(), McpError>;

    /// Whether the service is currently connected.
    fn is_connected(&self) -> bool;

    /// Discover tools for the given context.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ListTools`] or [`McpError::NotConnected`].
    async fn list_tools(&self, params: &McpListToolsParams) -> Result<Vec<McpToolDecl>, McpError>;

    /// Invoke a discovered tool.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::CallTool`] or [`McpError::NotConnected`].
    async fn call_tool(&self, params: &McpCallToolParams) -> Result<ToolResult, McpError>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Connection`] on teardown failure.
    async fn close(&self) -> Result<(), McpError>;
}

/// Adapter exposing a discovered MCP tool through the [`Tool`] trait.
pub struct McpTool {
    decl: McpToolDecl,
    service: Arc<dyn McpService>,
}

impl McpTool {
    /// Wrap a declaration and the service that owns it.
    #[must_use]
    pub fn new(decl: McpToolDecl, service: Arc<dyn McpService>) -> Self {
        Self { decl, service }
    }
}

impl fmt::Debug for McpTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpTool")
            .field("name", &self.decl.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn description(&self) -> String {
        self.decl.description.clone()
    }

    fn parameters(&self) -> Value {
        self.decl.input_schema.clone()
    }

    async fn execute(
        &self,
        args: Value,
        _ctx: &AgentContext,
        _call: &ToolUse,
    ) -> Result<ToolResult, ToolError> {
        let params = McpCallToolParams {
            name: self.decl.name.clone(),
            arguments: args,
            ext_info: None,
        };
        self.service
            .call_tool(&params)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))
    }
}

#[cfg(feature = "rmcp")]
pub use rmcp_client::RmcpClient;

#[cfg(feature = "rmcp")]
mod rmcp_client {
    //! `rmcp`-backed MCP client supporting HTTP and stdio transports.

    use std::sync::Mutex;

    use rmcp::{
        ServiceExt,
        model::{CallToolRequestParam, ClientCapabilities, Implementation, InitializeRequestParams},
        service::ServerSink,
        transport::{StreamableHttpClientTransport, child_process::TokioChildProcess},
    };
    use tokio::task::JoinHandle;

    use super::*;

    /// Transport selection for [`RmcpClient`].
    #[derive(Debug, Clone)]
    pub enum RmcpTransport {
        /// Streamable HTTP endpoint.
        Http {
            /// Server URL.
            url: String,
        },
        /// Local subprocess speaking stdio.
        Stdio {
            /// Command to execute.
            command: String,
            /// Command arguments.
            args: Vec<String>,
        },
    }

    struct Connection {
        sink: ServerSink,
        _handle: JoinHandle<()>,
    }

    /// An MCP client built on `rmcp`.
    pub struct RmcpClient {
        transport: RmcpTransport,
        connection: Mutex<Option<Connection>>,
    }

    impl RmcpClient {
        /// Create a client for an HTTP server.
        #[must_use]
        pub fn http(url: impl Into<String>) -> Self {
            Self {
                transport: RmcpTransport::Http { url: url.into() },
                connection: Mutex::new(None),
            }
        }

        /// Create a client for a local stdio server process.
        #[must_use]
        pub fn stdio(command: impl Into<String>, args: &[&str]) -> Self {
            Self {
                transport: RmcpTransport::Stdio {
                    command: command.into(),
                    args: args.iter().map(|s| (*s).to_owned()).collect(),
                },
                connection: Mutex::new(None),
            }
        }

        fn client_info() -> InitializeRequestParams {
            InitializeRequestParams {
                meta: None,
                protocol_version: Default::default(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: "tasuki".to_owned(),
                    version: env!("CARGO_PKG_VERSION").to_owned(),
                    ..Default::default()
                },
            }
        }

        fn sink(&self) -> Result<ServerSink, McpError> {
            self.connection
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|c| c.sink.clone())
                .ok_or(McpError::NotConnected)
        }
    }

    impl std::fmt::Debug for RmcpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RmcpClient")
                .field("transport", &self.transport)
                .field("connected", &self.is_connected())
                .finish()
        }
    }

    #[async_trait]
    impl McpService for RmcpClient {
        async fn connect(&self, signal: &AbortSignal) -> Result<(), McpError> {
            if self.is_connected() {
                return Ok(());
            }
            let connect = async {
                match &self.transport {
                    RmcpTransport::Http { url } => {
                        let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                        Self::client_info()
                            .serve(transport)
                            .await
                            .map_err(|e| McpError::Connection(e.to_string()))
                    }
                    RmcpTransport::Stdio { command, args } => {
                        let mut cmd = tokio::process::Command::new(command);
                        cmd.args(args);
                        let transport = TokioChildProcess::new(cmd)
                            .map_err(|e| McpError::Connection(e.to_string()))?;
                        Self::client_info()
                            .serve(transport)
                            .await
                            .map_err(|e| McpError::Connection(e.to_string()))
                    }
                }
            };
            let service = tokio::select! {
                result = connect => result?,
                () = signal.cancelled() => {
                    return Err(McpError::Connection("aborted".to_owned()));
                }
            };
            let sink = service.peer().clone();
            let handle = tokio::spawn(async move {
                let _ = service.waiting().await;
            });
            *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = Some(Connection {
                sink,
                _handle: handle,
            });
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connection
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
        }

        async fn list_tools(
            &self,
            _params: &McpListToolsParams,
        ) -> Result<Vec<McpToolDecl>, McpError> {
            let sink = self.sink()?;
            let listed = sink
                .list_tools(Default::default())
                .await
                .map_err(|e| McpError::ListTools(e.to_string()))?;
            Ok(listed
                .tools
                .into_iter()
                .map(|tool| McpToolDecl {
                    name: tool.name.to_string(),
                    description: tool
                        .description
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    input_schema: Value::Object((*tool.input_schema).clone()),
                })
                .collect())
        }

        async fn call_tool(&self, params: &McpCallToolParams) -> Result<ToolResult, McpError> {
            let sink = self.sink()?;
            let arguments = params.arguments.as_object().cloned();
            let outcome = sink
                .call_tool(CallToolRequestParam {
                    name: params.name.clone().into(),
                    arguments,
                })
                .await
                .map_err(|e| McpError::CallTool {
                    name: params.name.clone(),
                    message: e.to_string(),
                })?;

            let mut result = ToolResult::default();
            result.is_error = outcome.is_error.unwrap_or(false);
            for content in outcome.content {
                match content.raw {
                    rmcp::model::RawContent::Text(text) => {
                        result.content.push(crate::tool::ToolPart::Text {
                            text: text.text,
                        });
                    }
                    rmcp::model::RawContent::Image(image) => {
                        result.content.push(crate::tool::ToolPart::Image {
                            data: image.data,
                            mime_type: image.mime_type,
                        });
                    }
                    other => {
                        result.content.push(crate::tool::ToolPart::Text {
                            text: serde_json::to_string(&other).unwrap_or_default(),
                        });
                    }
                }
            }
            Ok(result)
        }

        async fn close(&self) -> Result<(), McpError> {
            if let Some(connection) = self
                .connection
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                connection._handle.abort();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;
    use std::sync::Mutex;

    /// In-memory MCP service for tests.
    struct FakeMcp {
        connected: std::sync::atomic::AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeMcp {
        fn new() -> Self {
            Self {
                connected: std::sync::atomic::AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl McpService for FakeMcp {
        async fn connect(&self, _signal: &AbortSignal) -> Result<(), McpError> {
            self.connected
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn list_tools(
            &self,
            params: &McpListToolsParams,
        ) -> Result<Vec<McpToolDecl>, McpError> {
            assert_eq!(params.agent_name.as_deref(), Some("Tester"));
            Ok(vec![McpToolDecl {
                name: "remote_echo".into(),
                description: "echo on the server".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, params: &McpCallToolParams) -> Result<ToolResult, McpError> {
            self.calls
                .lock()
                .unwrap()
                .push(params.name.clone());
            Ok(ToolResult::text(format!("remote: {}", params.arguments)))
        }

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mcp_tool_delegates_to_service() {
        let service = Arc::new(FakeMcp::new());
        service.connect(&AbortSignal::new()).await.unwrap();
        let decls = service
            .list_tools(&McpListToolsParams {
                agent_name: Some("Tester".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let tool = McpTool::new(decls[0].clone(), Arc::clone(&service) as Arc<dyn McpService>);
        assert_eq!(tool.name(), "remote_echo");

        let task = test_support::task_context();
        let ctx = test_support::agent_context(&task);
        let result = tool
            .execute(
                serde_json::json!({"message": "hi"}),
                &ctx,
                &ToolUse::new("c1", "remote_echo", Value::Null),
            )
            .await
            .unwrap();
        assert!(result.first_text().unwrap().contains("remote"));
        assert_eq!(service.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn control_hook_default_is_no_refresh() {
        let control = McpControl::default();
        assert!(!control.refresh);
        let control = McpControl::refresh_with(serde_json::Map::new());
        assert!(control.refresh);
    }
}
