//! One live MCP client session to one downstream server.

use std::{sync::Arc, time::Duration};

use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, ConfigureCommandExt, SseClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use tracing::{error, info, warn};

use crate::{
    error::{RegistryError, RegistryResult},
    spec::{DownstreamServerSpec, DownstreamTransport},
    tool::DownstreamTool,
};

type Client = RunningService<RoleClient, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Shutdown,
}

/// Owns one MCP client session to one downstream server, stdio or SSE.
///
/// Held exclusively by the `DownstreamRegistry` behind an `Arc`; no other component
/// keeps a strong reference. State and the transport handle are each guarded by their
/// own short-lived lock so a `call_tool` in flight never blocks the registry's index
/// mutation lock, matching the spec's requirement that only `initialize_all`, `add`,
/// `remove`, and `shutdown` take that lock for their whole critical section.
pub struct DownstreamSession {
    spec: DownstreamServerSpec,
    state: Mutex<SessionState>,
    client: Mutex<Option<Arc<Client>>>,
    tools: Mutex<Vec<DownstreamTool>>,
}

impl DownstreamSession {
    pub fn new(spec: DownstreamServerSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(SessionState::Uninitialized),
            client: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        }
    }

    pub fn spec(&self) -> &DownstreamServerSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Opens the transport, performs the MCP handshake, and caches the tool list.
    /// Both stdio and SSE connections retry transient failures with bounded
    /// exponential backoff; a connect error classified as permanent (a bad
    /// command, a rejected handshake) aborts immediately instead of retrying.
    pub async fn initialize(&self) -> RegistryResult<()> {
        *self.state.lock() = SessionState::Initializing;

        let client = self.connect_with_retry().await;

        let client = match client {
            Ok(client) => client,
            Err(e) => {
                *self.state.lock() = SessionState::Uninitialized;
                return Err(e);
            }
        };

        let discovered = client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| RegistryError::ProtocolError(format!("list_tools on '{}': {e}", self.spec.name)))?;

        let tools: Vec<DownstreamTool> = discovered
            .into_iter()
            .map(|t| DownstreamTool::from_rmcp(&self.spec.name, t))
            .collect();

        info!(server = %self.spec.name, tool_count = tools.len(), "downstream session ready");

        *self.tools.lock() = tools;
        *self.client.lock() = Some(Arc::new(client));
        *self.state.lock() = SessionState::Ready;
        Ok(())
    }

    async fn connect(&self) -> RegistryResult<Client> {
        match &self.spec.transport {
            DownstreamTransport::Stdio { .. } => self.connect_stdio().await,
            DownstreamTransport::Sse { .. } => self.connect_sse().await,
        }
    }

    async fn connect_stdio(&self) -> RegistryResult<Client> {
        let DownstreamTransport::Stdio { command, args, env } = &self.spec.transport else {
            unreachable!("connect_stdio called on non-stdio spec")
        };

        let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
            |cmd| {
                cmd.args(args)
                    .envs(env.iter())
                    .stderr(std::process::Stdio::inherit());
            },
        ))
        .map_err(|e| RegistryError::TransportError(format!("spawn '{command}': {e}")))?;

        ().serve(transport).await.map_err(|e| {
            RegistryError::ProtocolError(format!(
                "handshake with stdio server '{}': {e}",
                self.spec.name
            ))
        })
    }

    async fn connect_with_retry(&self) -> RegistryResult<Client> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        backoff::future::retry(backoff, || async {
            match self.connect().await {
                Ok(client) => Ok(client),
                Err(e) if Self::is_permanent(&e) => {
                    error!(server = %self.spec.name, error = %e, "permanent connect failure, not retrying");
                    Err(backoff::Error::permanent(e))
                }
                Err(e) => {
                    warn!(server = %self.spec.name, error = %e, "connect failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
    }

    async fn connect_sse(&self) -> RegistryResult<Client> {
        let DownstreamTransport::Sse { url } = &self.spec.transport else {
            unreachable!("connect_sse called on non-sse spec")
        };

        let cfg = SseClientConfig {
            sse_endpoint: url.clone().into(),
            ..Default::default()
        };

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RegistryError::TransportError(format!("build HTTP client: {e}")))?;

        let transport = SseClientTransport::start_with_client(http_client, cfg)
            .await
            .map_err(|e| RegistryError::TransportError(format!("open SSE stream to '{url}': {e}")))?;

        ().serve(transport).await.map_err(|e| {
            RegistryError::ProtocolError(format!(
                "handshake with SSE server '{}': {e}",
                self.spec.name
            ))
        })
    }

    fn is_permanent(error: &RegistryError) -> bool {
        matches!(
            error,
            RegistryError::TransportError(_) | RegistryError::ProtocolError(_)
        )
    }

    pub fn list_tools(&self) -> Vec<DownstreamTool> {
        self.tools.lock().clone()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.lock().len()
    }

    /// Forwards to the downstream server and returns its result verbatim. Never
    /// holds a lock across the network round trip: the `Arc<Client>` is cloned out
    /// under the lock, the RPC runs against the clone.
    pub async fn call_tool(
        &self,
        original_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> RegistryResult<CallToolResult> {
        if self.state() != SessionState::Ready {
            return Err(RegistryError::NotReady(self.spec.name.clone()));
        }
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| RegistryError::NotReady(self.spec.name.clone()))?;

        let request = CallToolRequestParam {
            name: original_name.to_string().into(),
            arguments,
        };

        client
            .call_tool(request)
            .await
            .map_err(|e| RegistryError::ProtocolError(format!("call_tool '{original_name}': {e}")))
    }

    /// Terminates the transport and releases its resources. Idempotent, and safe to
    /// call even when `initialize` never completed. If some other strong reference to
    /// the client is still outstanding (a `call_tool` in flight), cancellation is
    /// skipped rather than blocked on; the in-flight call finishes against its own
    /// clone and the transport is dropped once that clone goes out of scope.
    pub async fn shutdown(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    if let Err(e) = client.cancel().await {
                        warn!(server = %self.spec.name, error = %e, "error shutting down downstream session");
                    }
                }
                Err(_) => {
                    warn!(server = %self.spec.name, "downstream client still in use, skipping explicit cancel");
                }
            }
        }
        *self.state.lock() = SessionState::Shutdown;
    }

    /// Builds a session already in the *Ready* state with a fixed tool list, without
    /// opening any transport. Used by registry- and composer-level tests that exercise
    /// the index/policy bookkeeping against a known tool universe.
    #[cfg(any(test, feature = "test-util"))]
    pub fn ready_for_test(spec: DownstreamServerSpec, tools: Vec<DownstreamTool>) -> Self {
        Self {
            spec,
            state: Mutex::new(SessionState::Ready),
            client: Mutex::new(None),
            tools: Mutex::new(tools),
        }
    }
}
