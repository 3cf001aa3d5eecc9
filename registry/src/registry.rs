//! Holds every downstream session and the flat tool-name index derived from them.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    error::{RegistryError, RegistryResult},
    session::{DownstreamSession, SessionState},
    spec::DownstreamServerSpec,
    tool::{contains_reserved_separator, DownstreamTool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Connected,
    NotFound,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Connected => "connected",
            ServerStatus::NotFound => "not_found",
        }
    }
}

#[derive(Default)]
struct Indices {
    sessions: HashMap<String, Arc<DownstreamSession>>,
    /// Declaration order, mirrored across add/remove so iteration is deterministic.
    order: Vec<String>,
    /// control_name -> owning server name, for O(1) dependency-free lookup.
    tool_to_server: HashMap<String, String>,
}

/// Multiplexes every downstream MCP session behind a single mutation lock.
///
/// The lock guards only the three indices, never a network round trip: `call_tool`
/// clones the `Arc<DownstreamSession>` out from under the lock and then awaits
/// against the clone, so one slow downstream never blocks registration, removal, or
/// unrelated calls.
pub struct DownstreamRegistry {
    indices: Mutex<Indices>,
    initialized: Mutex<bool>,
}

impl Default for DownstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DownstreamRegistry {
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(Indices::default()),
            initialized: Mutex::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock()
    }

    /// Registers each spec in declaration order. On the first failure the error is
    /// propagated and every session registered so far is left registered; the caller
    /// is expected to call `shutdown` to release them.
    pub async fn initialize_all(&self, specs: Vec<DownstreamServerSpec>) -> RegistryResult<()> {
        for spec in specs {
            self.register(spec).await?;
        }
        *self.initialized.lock() = true;
        Ok(())
    }

    /// Registers one more server after the registry is already initialized.
    pub async fn add(&self, spec: DownstreamServerSpec) -> RegistryResult<()> {
        if !self.is_initialized() {
            return Err(RegistryError::NotInitialized);
        }
        if contains_reserved_separator(&spec.name) {
            warn!(server = %spec.name, "server name contains the control-name separator '-'; control names may collide");
        }
        if self.indices.lock().sessions.contains_key(&spec.name) {
            return Err(RegistryError::AlreadyExists(spec.name.clone()));
        }
        self.register(spec).await
    }

    async fn register(&self, spec: DownstreamServerSpec) -> RegistryResult<()> {
        let name = spec.name.clone();
        let session = DownstreamSession::new(spec);
        session.initialize().await?;
        let tools = session.list_tools();

        let mut indices = self.indices.lock();
        for tool in &tools {
            indices
                .tool_to_server
                .insert(tool.control_name(), tool.owner_server_name.clone());
        }
        indices.order.push(name.clone());
        indices.sessions.insert(name.clone(), Arc::new(session));
        drop(indices);

        info!(server = %name, "registered downstream server");
        Ok(())
    }

    /// Removes a session from all three indices, then shuts it down. Does not check
    /// whether any kit still depends on it; that is the Composer's job.
    pub async fn remove(&self, name: &str) -> RegistryResult<()> {
        let session = {
            let mut indices = self.indices.lock();
            let session = indices
                .sessions
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            indices.order.retain(|n| n != name);
            let prefix = format!("{name}-");
            indices
                .tool_to_server
                .retain(|control_name, _| !control_name.starts_with(&prefix));
            session
        };
        session.shutdown().await;
        info!(server = %name, "removed downstream server");
        Ok(())
    }

    /// Shuts down every session, in reverse registration order, unwinding the
    /// registry's scoped resource stack on every exit path.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<DownstreamSession>)> = {
            let mut indices = self.indices.lock();
            let order: Vec<String> = indices.order.drain(..).rev().collect();
            let sessions = order
                .into_iter()
                .filter_map(|name| indices.sessions.remove(&name).map(|s| (name, s)))
                .collect();
            indices.tool_to_server.clear();
            sessions
        };
        for (name, session) in sessions {
            session.shutdown().await;
            info!(server = %name, "downstream session shut down");
        }
    }

    /// Kit names whose `assigned_servers` contains `name`.
    pub fn check_dependencies(&self, name: &str, kits: &[(&str, &[String])]) -> Vec<String> {
        kits.iter()
            .filter(|(_, assigned)| assigned.iter().any(|s| s == name))
            .map(|(kit_name, _)| kit_name.to_string())
            .collect()
    }

    pub fn list_available_servers(&self) -> Vec<String> {
        self.indices.lock().order.clone()
    }

    pub fn get_server_status(&self, name: &str) -> ServerStatus {
        if self.indices.lock().sessions.contains_key(name) {
            ServerStatus::Connected
        } else {
            ServerStatus::NotFound
        }
    }

    pub fn get_server_tools_count(&self, name: &str) -> Option<usize> {
        self.session(name).map(|s| s.tool_count())
    }

    pub fn get_tool_by_control_name(&self, control_name: &str) -> Option<DownstreamTool> {
        let server_name = self.indices.lock().tool_to_server.get(control_name)?.clone();
        self.session(&server_name)?
            .list_tools()
            .into_iter()
            .find(|t| t.control_name() == control_name)
    }

    pub fn get_server_by_control_name(&self, control_name: &str) -> Option<String> {
        self.indices.lock().tool_to_server.get(control_name).cloned()
    }

    /// All tools currently registered for one server, in discovery order.
    pub fn list_server_tools(&self, server_name: &str) -> Option<Vec<DownstreamTool>> {
        self.session(server_name).map(|s| s.list_tools())
    }

    pub fn session_state(&self, server_name: &str) -> Option<SessionState> {
        self.session(server_name).map(|s| s.state())
    }

    fn session(&self, name: &str) -> Option<Arc<DownstreamSession>> {
        self.indices.lock().sessions.get(name).cloned()
    }

    /// Invokes a tool on the server that owns it, looked up by control name.
    pub async fn call_tool(
        &self,
        control_name: &str,
        original_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> RegistryResult<rmcp::model::CallToolResult> {
        let server_name = self
            .get_server_by_control_name(control_name)
            .ok_or_else(|| RegistryError::ToolNotFound(control_name.to_string()))?;
        let session = self
            .session(&server_name)
            .ok_or_else(|| RegistryError::NotFound(server_name.clone()))?;
        session.call_tool(original_name, arguments).await
    }

    /// Inserts an already-`Ready` test session directly into the indices, bypassing
    /// `initialize`'s transport handshake. Marks the registry initialized.
    #[cfg(any(test, feature = "test-util"))]
    pub fn insert_for_test(&self, session: DownstreamSession) {
        let name = session.spec().name.clone();
        let tools = session.list_tools();
        let mut indices = self.indices.lock();
        for tool in &tools {
            indices
                .tool_to_server
                .insert(tool.control_name(), tool.owner_server_name.clone());
        }
        indices.order.push(name.clone());
        indices.sessions.insert(name, Arc::new(session));
        drop(indices);
        *self.initialized.lock() = true;
    }
}
