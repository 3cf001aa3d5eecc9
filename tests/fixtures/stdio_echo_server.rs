//! A trivial stdio MCP server used only as a test fixture: it serves whatever
//! tool names are passed on the command line, echoing back its arguments on
//! `CallTool`. Spawned by integration tests via `DownstreamServerSpec::stdio`
//! to exercise the registry and composer against a real child process instead
//! of the synthetic `ready_for_test` fixtures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use clap::Parser;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::stdio;
use rmcp::{ServerHandler, ServiceExt};

#[derive(Parser, Debug)]
struct Cli {
    /// Comma-separated tool names this instance exposes.
    #[arg(long, value_delimiter = ',', default_value = "echo")]
    tools: Vec<String>,
}

#[derive(Clone)]
struct EchoServer {
    tool_names: Vec<String>,
}

impl ServerHandler for EchoServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: Some(false) }),
                ..Default::default()
            },
            instructions: Some("Test fixture: echoes CallTool arguments back as text.".to_string()),
            ..Default::default()
        }
    }

    fn list_tools<'a>(
        &'a self,
        _params: Option<PaginatedRequestParam>,
        _ctx: RequestContext<RoleServer>,
    ) -> Pin<Box<dyn Future<Output = Result<ListToolsResult, ErrorData>> + Send + 'a>> {
        Box::pin(async move {
            let tools = self
                .tool_names
                .iter()
                .map(|name| Tool {
                    name: name.clone().into(),
                    title: None,
                    description: Some("test fixture tool".to_string().into()),
                    input_schema: Arc::new(serde_json::Map::new()),
                    output_schema: None,
                    annotations: None,
                    icons: None,
                })
                .collect();
            Ok(ListToolsResult { tools, next_cursor: None })
        })
    }

    fn call_tool<'a>(
        &'a self,
        params: CallToolRequestParam,
        _ctx: RequestContext<RoleServer>,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ErrorData>> + Send + 'a>> {
        Box::pin(async move {
            let echoed = serde_json::to_string(&params.arguments).unwrap_or_default();
            Ok(CallToolResult::success(vec![Content::text(format!(
                "{}:{echoed}",
                params.name
            ))]))
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let server = EchoServer { tool_names: cli.tools };
    let running = server.serve(stdio()).await?;
    running.waiting().await?;
    Ok(())
}
