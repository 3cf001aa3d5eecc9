//! The per-kit MCP server instance: serves `ListTools`/`CallTool` over SSE,
//! translating renamed tool identifiers into calls against the owning
//! downstream session.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use composer_registry::DownstreamRegistry;
use parking_lot::RwLock;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, ToolsCapability,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::ServerHandler;
use tokio_util::sync::CancellationToken;

use crate::kit::Kit;

/// `Constructed -> Setup -> Active -> Removed`. Only `Active` gateways are
/// mounted on the host router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Constructed,
    Setup,
    Active,
    Removed,
}

/// The MCP `ServerHandler` backing one kit. Cheap to clone: every clone shares
/// the same kit and registry handles, as required by `with_service`'s
/// per-connection factory closure.
#[derive(Clone)]
pub struct KitServer {
    kit_name: String,
    kit: Arc<RwLock<Kit>>,
    registry: Arc<DownstreamRegistry>,
}

impl KitServer {
    fn new(kit_name: String, kit: Arc<RwLock<Kit>>, registry: Arc<DownstreamRegistry>) -> Self {
        Self {
            kit_name,
            kit,
            registry,
        }
    }

    fn rejected(reason: &str) -> CallToolResult {
        CallToolResult::error(vec![Content::text(reason.to_string())])
    }

    /// Runs one kit's enable/disable/assignment policy gate against
    /// `control_name` and, if it passes, forwards the call to the owning
    /// downstream server. Shared by the live `ServerHandler::call_tool` path
    /// and by callers that invoke a kit's tools without an MCP session.
    pub async fn dispatch_call_tool(
        kit: &Kit,
        registry: &DownstreamRegistry,
        control_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> CallToolResult {
        let server_name = {
            if !kit.enabled {
                return Self::rejected("kit is disabled");
            }
            if !kit.tools_enabled.get(control_name).copied().unwrap_or(false) {
                return Self::rejected("tool is disabled or unknown to this kit");
            }
            let Some(server_name) = kit.tool_to_server.get(control_name).cloned() else {
                return Self::rejected("tool is not mapped to a server");
            };
            if !kit.servers_enabled.get(&server_name).copied().unwrap_or(false) {
                return Self::rejected("owning server is disabled");
            }
            if !kit.assigned_servers.is_empty() && !kit.is_server_assigned(&server_name) {
                return Self::rejected("owning server is not assigned to this kit");
            }
            server_name
        };

        let Some(tool) = registry.get_tool_by_control_name(control_name) else {
            return Self::rejected("tool not found in registry");
        };

        match registry.call_tool(control_name, &tool.original_name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(server = %server_name, tool = %control_name, error = %e, "downstream call failed");
                Self::rejected(&e.to_string())
            }
        }
    }
}

impl ServerHandler for KitServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            instructions: Some(format!(
                "Curated tool view for kit '{}'. Tool names are prefixed with their owning server.",
                self.kit_name
            )),
            ..Default::default()
        }
    }

    fn list_tools<'a>(
        &'a self,
        _params: Option<PaginatedRequestParam>,
        _ctx: RequestContext<RoleServer>,
    ) -> Pin<Box<dyn Future<Output = Result<ListToolsResult, ErrorData>> + Send + 'a>> {
        Box::pin(async move {
            let enabled_control_names = {
                let kit = self.kit.read();
                if !kit.enabled {
                    return Ok(ListToolsResult {
                        tools: Vec::new(),
                        next_cursor: None,
                    });
                }
                kit.list_enabled_tool_control_names()
            };

            let tools = enabled_control_names
                .into_iter()
                .filter_map(|control_name| {
                    self.registry
                        .get_tool_by_control_name(&control_name)
                        .map(|tool| tool.renamed())
                })
                .collect();

            Ok(ListToolsResult {
                tools,
                next_cursor: None,
            })
        })
    }

    fn call_tool<'a>(
        &'a self,
        params: CallToolRequestParam,
        _ctx: RequestContext<RoleServer>,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ErrorData>> + Send + 'a>> {
        Box::pin(async move {
            let control_name = params.name.to_string();
            let kit = self.kit.read().clone();
            Ok(Self::dispatch_call_tool(&kit, &self.registry, &control_name, params.arguments).await)
        })
    }
}

/// One MCP server instance exposing a single kit over SSE, mounted under
/// `/{kit.name}` by the Composer.
pub struct Gateway {
    kit_name: String,
    sse_path: String,
    messages_path: String,
    external_endpoint_url: String,
    state: GatewayState,
    router: Option<axum::Router>,
    ct: Option<CancellationToken>,
}

impl Gateway {
    pub fn new(kit_name: impl Into<String>, proxy_base: &str) -> Self {
        let kit_name = kit_name.into();
        let sse_path = format!("/mcp/{kit_name}/sse");
        let messages_path = format!("/mcp/{kit_name}/messages");
        let external_endpoint_url = format!("{proxy_base}{sse_path}");
        Self {
            kit_name,
            sse_path,
            messages_path,
            external_endpoint_url,
            state: GatewayState::Constructed,
            router: None,
            ct: None,
        }
    }

    pub fn kit_name(&self) -> &str {
        &self.kit_name
    }

    pub fn sse_path(&self) -> &str {
        &self.sse_path
    }

    pub fn messages_path(&self) -> &str {
        &self.messages_path
    }

    pub fn external_endpoint_url(&self) -> &str {
        &self.external_endpoint_url
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    /// Wires the SSE transport and MCP handlers, producing a mountable router.
    /// Only `Constructed` gateways may be set up.
    pub fn setup(&mut self, kit: Arc<RwLock<Kit>>, registry: Arc<DownstreamRegistry>) {
        let ct = CancellationToken::new();
        let config = SseServerConfig {
            bind: "127.0.0.1:0".parse().expect("static bind addr"),
            sse_path: self.sse_path.clone(),
            post_path: self.messages_path.clone(),
            ct: ct.clone(),
            sse_keep_alive: Some(std::time::Duration::from_secs(30)),
        };
        let (sse_server, router) = SseServer::new(config);
        let server = KitServer::new(self.kit_name.clone(), kit, registry);
        sse_server.with_service(move || server.clone());

        self.router = Some(router);
        self.ct = Some(ct);
        self.state = GatewayState::Setup;
    }

    /// Returns the mountable HTTP sub-application. Transitions to `Active`.
    pub fn as_http_application(&mut self) -> axum::Router {
        self.state = GatewayState::Active;
        self.router.clone().expect("setup must run before mounting")
    }

    pub fn remove(&mut self) {
        if let Some(ct) = self.ct.take() {
            ct.cancel();
        }
        self.state = GatewayState::Removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_derived_deterministically() {
        let gateway = Gateway::new("simple-kit", "http://localhost:8000");
        assert_eq!(gateway.sse_path(), "/mcp/simple-kit/sse");
        assert_eq!(gateway.messages_path(), "/mcp/simple-kit/messages");
        assert_eq!(
            gateway.external_endpoint_url(),
            "http://localhost:8000/mcp/simple-kit/sse"
        );
    }

    #[test]
    fn starts_in_constructed_state() {
        let gateway = Gateway::new("K", "http://localhost:8000");
        assert_eq!(gateway.state(), GatewayState::Constructed);
    }
}
