//! Top-level orchestrator: owns the registry, the kit map, and the gateway
//! map; mediates every mutation and drives configuration persistence.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use composer_registry::{DownstreamRegistry, DownstreamServerSpec, ServerStatus};
use parking_lot::{Mutex, RwLock};
use rmcp::model::CallToolResult;
use tower::ServiceExt as _;
use tracing::{info, warn};

use crate::config::ConfigurationManager;
use crate::error::{ComposerError, ComposerResult};
use crate::gateway::{Gateway, KitServer};
use crate::kit::Kit;

struct KitEntry {
    kit: Arc<RwLock<Kit>>,
}

pub struct Composer {
    registry: Arc<DownstreamRegistry>,
    kits: Mutex<HashMap<String, KitEntry>>,
    gateways: Mutex<HashMap<String, Gateway>>,
    routes: Mutex<HashMap<String, axum::Router>>,
    live_router: Arc<ArcSwap<axum::Router>>,
    config: Arc<ConfigurationManager>,
    proxy_base: String,
}

impl Composer {
    pub fn new(
        registry: Arc<DownstreamRegistry>,
        config: Arc<ConfigurationManager>,
        proxy_base: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            kits: Mutex::new(HashMap::new()),
            gateways: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            live_router: Arc::new(ArcSwap::from_pointee(axum::Router::new())),
            config,
            proxy_base: proxy_base.into(),
        }
    }

    pub fn registry(&self) -> &Arc<DownstreamRegistry> {
        &self.registry
    }

    // ---- Kit ----------------------------------------------------------

    pub fn list_kits(&self) -> Vec<Kit> {
        self.kits.lock().values().map(|e| e.kit.read().clone()).collect()
    }

    pub fn get_kit(&self, name: &str) -> ComposerResult<Kit> {
        self.kits
            .lock()
            .get(name)
            .map(|e| e.kit.read().clone())
            .ok_or_else(|| ComposerError::NotFound(format!("kit '{name}'")))
    }

    fn kit_handle(&self, name: &str) -> ComposerResult<Arc<RwLock<Kit>>> {
        self.kits
            .lock()
            .get(name)
            .map(|e| e.kit.clone())
            .ok_or_else(|| ComposerError::NotFound(format!("kit '{name}'")))
    }

    /// Builds a kit from the entire current registry: every discovered
    /// server/tool is populated into `servers_enabled`/`tools_enabled`
    /// (defaulting to `default_enabled`), with `assigned_servers` left empty
    /// so the kit behaves as a legacy whole-registry view until explicitly
    /// narrowed.
    pub fn create_kit(&self, name: &str, default_enabled: bool) -> ComposerResult<Kit> {
        if !self.registry.is_initialized() {
            return Err(ComposerError::ValidationError(
                "downstream registry not initialized".to_string(),
            ));
        }
        if self.kits.lock().contains_key(name) {
            return Err(ComposerError::Conflict(format!("kit '{name}' already exists")));
        }

        let mut kit = Kit::new(name);
        for server_name in self.registry.list_available_servers() {
            kit.servers_enabled.insert(server_name.clone(), default_enabled);
            let mut tool_names = Vec::new();
            for tool in self.registry.list_server_tools(&server_name).unwrap_or_default() {
                let control_name = tool.control_name();
                kit.tools_enabled.insert(control_name.clone(), default_enabled);
                kit.tool_to_server.insert(control_name.clone(), server_name.clone());
                tool_names.push(control_name);
            }
            kit.hierarchy.insert(server_name, tool_names);
        }

        self.kits.lock().insert(
            name.to_string(),
            KitEntry {
                kit: Arc::new(RwLock::new(kit.clone())),
            },
        );
        Ok(kit)
    }

    pub fn enable_kit(&self, name: &str) -> ComposerResult<()> {
        self.kit_handle(name)?.write().enable_kit();
        Ok(())
    }

    pub fn disable_kit(&self, name: &str) -> ComposerResult<()> {
        self.kit_handle(name)?.write().disable_kit();
        Ok(())
    }

    pub fn enable_server(&self, kit_name: &str, server_name: &str) -> ComposerResult<()> {
        self.kit_handle(kit_name)?.write().enable_server(server_name);
        Ok(())
    }

    pub fn disable_server(&self, kit_name: &str, server_name: &str) -> ComposerResult<()> {
        self.kit_handle(kit_name)?.write().disable_server(server_name);
        Ok(())
    }

    pub fn enable_tool(&self, kit_name: &str, control_name: &str) -> ComposerResult<()> {
        self.kit_handle(kit_name)?.write().enable_tool(control_name);
        Ok(())
    }

    pub fn disable_tool(&self, kit_name: &str, control_name: &str) -> ComposerResult<()> {
        self.kit_handle(kit_name)?.write().disable_tool(control_name);
        Ok(())
    }

    /// Verifies the server exists and is not already assigned, mutates the
    /// kit, repopulates its hierarchy for that server from the registry's
    /// current tool list, then persists.
    pub async fn assign_server_to_kit(
        &self,
        kit_name: &str,
        server_name: &str,
        auto_enable: bool,
    ) -> ComposerResult<()> {
        if self.registry.get_server_status(server_name) == ServerStatus::NotFound {
            return Err(ComposerError::NotFound(format!("server '{server_name}'")));
        }
        let kit_handle = self.kit_handle(kit_name)?;
        if kit_handle.read().is_server_assigned(server_name) {
            return Err(ComposerError::Conflict(format!(
                "server '{server_name}' already assigned to kit '{kit_name}'"
            )));
        }

        let tools = self.registry.list_server_tools(server_name).unwrap_or_default();
        {
            let mut kit = kit_handle.write();
            kit.assign(server_name);
            let mut tool_names = Vec::with_capacity(tools.len());
            for tool in &tools {
                let control_name = tool.control_name();
                kit.tools_enabled.insert(control_name.clone(), auto_enable);
                kit.tool_to_server.insert(control_name.clone(), server_name.to_string());
                tool_names.push(control_name);
            }
            kit.hierarchy.insert(server_name.to_string(), tool_names);
        }

        let snapshot = kit_handle.read().clone();
        self.config.update_kit_assignments(&snapshot).await
    }

    pub async fn unassign_server_from_kit(
        &self,
        kit_name: &str,
        server_name: &str,
    ) -> ComposerResult<()> {
        let kit_handle = self.kit_handle(kit_name)?;
        if !kit_handle.read().is_server_assigned(server_name) {
            return Err(ComposerError::ValidationError(format!(
                "server '{server_name}' is not assigned to kit '{kit_name}'"
            )));
        }
        kit_handle.write().unassign(server_name);
        let snapshot = kit_handle.read().clone();
        self.config.update_kit_assignments(&snapshot).await
    }

    /// For every kit absent from persisted assignments, synthesizes one from
    /// its currently-enabled servers and persists it (legacy upgrade path).
    /// For every kit present, overlays the persisted fields onto the
    /// in-memory kit.
    pub async fn migrate_kits(&self) -> ComposerResult<()> {
        let persisted = self.config.load_kit_assignments().await?;
        let kit_names: Vec<String> = self.kits.lock().keys().cloned().collect();

        for name in kit_names {
            let kit_handle = self.kit_handle(&name)?;
            match persisted.get(&name) {
                Some(assignment) => {
                    let mut kit = kit_handle.write();
                    kit.assigned_servers = assignment.assigned_servers.clone();
                    kit.servers_enabled.extend(assignment.servers_enabled.clone());
                    kit.tools_enabled.extend(assignment.tools_enabled.clone());
                    kit.hierarchy
                        .extend(assignment.servers_tools_hierarchy_map.clone());
                    kit.tool_to_server.extend(assignment.tools_servers_map.clone());
                }
                None => {
                    let assigned_servers: Vec<String> = {
                        let kit = kit_handle.read();
                        kit.servers_enabled
                            .iter()
                            .filter(|(_, &enabled)| enabled)
                            .map(|(name, _)| name.clone())
                            .collect()
                    };
                    kit_handle.write().assigned_servers = assigned_servers;
                    let snapshot = kit_handle.read().clone();
                    self.config.update_kit_assignments(&snapshot).await?;
                    info!(kit = %name, "migrated legacy kit to explicit server assignment");
                }
            }
        }
        Ok(())
    }

    // ---- Gateway --------------------------------------------------------

    pub fn list_gateway_names(&self) -> Vec<String> {
        self.gateways.lock().keys().cloned().collect()
    }

    pub fn gateway_info(&self, name: &str) -> ComposerResult<(String, String, String)> {
        let gateways = self.gateways.lock();
        let gateway = gateways
            .get(name)
            .ok_or_else(|| ComposerError::NotFound(format!("gateway '{name}'")))?;
        Ok((
            gateway.sse_path().to_string(),
            gateway.messages_path().to_string(),
            gateway.external_endpoint_url().to_string(),
        ))
    }

    pub fn add_gateway(&self, kit_name: &str) -> ComposerResult<()> {
        if self.gateways.lock().contains_key(kit_name) {
            return Err(ComposerError::Conflict(format!("gateway '{kit_name}' already exists")));
        }
        let kit_handle = self.kit_handle(kit_name)?;

        let mut gateway = Gateway::new(kit_name, &self.proxy_base);
        gateway.setup(kit_handle, self.registry.clone());
        let router = gateway.as_http_application();

        self.routes.lock().insert(kit_name.to_string(), router);
        self.gateways.lock().insert(kit_name.to_string(), gateway);
        self.publish_router();
        info!(kit = %kit_name, "gateway mounted");
        Ok(())
    }

    /// Refuses if fewer than two gateways would remain.
    pub fn remove_gateway(&self, kit_name: &str) -> ComposerResult<()> {
        if self.gateways.lock().len() < 2 {
            return Err(ComposerError::DependencyViolation(
                "cannot remove the last gateway".to_string(),
            ));
        }
        let mut gateway = self
            .gateways
            .lock()
            .remove(kit_name)
            .ok_or_else(|| ComposerError::NotFound(format!("gateway '{kit_name}'")))?;
        gateway.remove();
        if self.routes.lock().remove(kit_name).is_none() {
            warn!(kit = %kit_name, "no matching route found for removal");
        }
        self.publish_router();
        Ok(())
    }

    /// Folds every currently mounted gateway into a fresh top-level router,
    /// each nested at `/{kit.name}`.
    fn rebuild_router(&self) -> axum::Router {
        let routes = self.routes.lock();
        routes
            .iter()
            .fold(axum::Router::new(), |app, (name, sub)| {
                app.nest(&format!("/{name}"), sub.clone())
            })
    }

    /// Rebuilds the mount set and publishes it to `live_router`, so every
    /// request already in flight against `dynamic_router()` sees it on its
    /// next hop. Called after every `add_gateway`/`remove_gateway`.
    fn publish_router(&self) {
        self.live_router.store(Arc::new(self.rebuild_router()));
    }

    /// A router whose fallback always dispatches against the current mount
    /// set, even after it's been swapped out from under it by a later
    /// `add_gateway`/`remove_gateway`. This, not `rebuild_router`, is what
    /// `main.rs` hands to `axum::serve`.
    pub fn dynamic_router(&self) -> axum::Router {
        let live_router = self.live_router.clone();
        axum::Router::new().fallback(move |req: axum::extract::Request| {
            let live_router = live_router.clone();
            async move {
                let current = (**live_router.load()).clone();
                current
                    .oneshot(req)
                    .await
                    .unwrap_or_else(|never: std::convert::Infallible| match never {})
            }
        })
    }

    /// Dispatches a tool call through one kit's policy gate, exactly as a
    /// connected MCP client hitting that kit's gateway would. Useful for
    /// embedding callers and tests that don't want to open an SSE session
    /// just to exercise enable/disable/assignment policy.
    pub async fn call_tool_via_kit(
        &self,
        kit_name: &str,
        control_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> ComposerResult<CallToolResult> {
        let kit = self.get_kit(kit_name)?;
        Ok(KitServer::dispatch_call_tool(&kit, &self.registry, control_name, arguments).await)
    }

    // ---- Downstream servers ----------------------------------------------

    pub async fn create_mcp_server(&self, spec: DownstreamServerSpec) -> ComposerResult<()> {
        self.registry.add(spec.clone()).await?;
        self.config.add_mcp_server(&spec).await
    }

    /// Refuses if any kit still depends on the server.
    pub async fn delete_mcp_server(&self, name: &str) -> ComposerResult<()> {
        let dependents = {
            let kits = self.kits.lock();
            let kit_refs: Vec<(&str, Vec<String>)> = kits
                .iter()
                .map(|(n, e)| (n.as_str(), e.kit.read().assigned_servers.clone()))
                .collect();
            let borrowed: Vec<(&str, &[String])> =
                kit_refs.iter().map(|(n, v)| (*n, v.as_slice())).collect();
            self.registry.check_dependencies(name, &borrowed)
        };

        if !dependents.is_empty() {
            return Err(ComposerError::DependencyViolation(format!(
                "server '{name}' is still assigned to kit(s): {}",
                dependents.join(", ")
            )));
        }

        self.registry.remove(name).await?;
        self.config.remove_mcp_server(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use composer_registry::{DownstreamServerSpec, DownstreamSession, DownstreamTool};
    use rmcp::model::Tool as RmcpTool;

    fn fake_tool(name: &str) -> RmcpTool {
        RmcpTool {
            name: std::borrow::Cow::Owned(name.to_string()),
            title: None,
            description: None,
            input_schema: std::sync::Arc::new(serde_json::Map::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    fn seeded_composer() -> (Composer, tempfile::TempDir) {
        let registry = Arc::new(DownstreamRegistry::new());
        let a = DownstreamSession::ready_for_test(
            DownstreamServerSpec::stdio("A", "true", vec![], Default::default()),
            vec![
                DownstreamTool::from_rmcp("A", fake_tool("t1")),
                DownstreamTool::from_rmcp("A", fake_tool("t2")),
            ],
        );
        let b = DownstreamSession::ready_for_test(
            DownstreamServerSpec::stdio("B", "true", vec![], Default::default()),
            vec![DownstreamTool::from_rmcp("B", fake_tool("t1"))],
        );
        registry.insert_for_test(a);
        registry.insert_for_test(b);

        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigurationManager::new(dir.path().join("config.json")));
        (Composer::new(registry, config, "http://localhost:8000"), dir)
    }

    #[test]
    fn create_kit_populates_whole_registry_by_default() {
        let (composer, _dir) = seeded_composer();
        let kit = composer.create_kit("K", true).unwrap();
        let mut visible = kit.list_enabled_tool_control_names();
        visible.sort();
        assert_eq!(visible, vec!["A-t1", "A-t2", "B-t1"]);
    }

    #[tokio::test]
    async fn assign_server_to_kit_filters_visibility() {
        let (composer, _dir) = seeded_composer();
        composer.create_kit("K", true).unwrap();
        composer.assign_server_to_kit("K", "A", true).await.unwrap();
        let kit = composer.get_kit("K").unwrap();
        let mut visible = kit.list_enabled_tool_control_names();
        visible.sort();
        assert_eq!(visible, vec!["A-t1", "A-t2"]);
    }

    #[tokio::test]
    async fn delete_mcp_server_fails_with_dependency_violation() {
        let (composer, _dir) = seeded_composer();
        composer.create_kit("K", true).unwrap();
        composer.assign_server_to_kit("K", "A", true).await.unwrap();
        let err = composer.delete_mcp_server("A").await.unwrap_err();
        assert!(matches!(err, ComposerError::DependencyViolation(_)));
        assert_eq!(composer.registry.get_server_status("A").as_str(), "connected");
    }

    #[tokio::test]
    async fn remove_gateway_requires_at_least_two() {
        let (composer, _dir) = seeded_composer();
        composer.create_kit("K1", true).unwrap();
        composer.add_gateway("K1").unwrap();
        let err = composer.remove_gateway("K1").unwrap_err();
        assert!(matches!(err, ComposerError::DependencyViolation(_)));

        composer.create_kit("K2", true).unwrap();
        composer.add_gateway("K2").unwrap();
        composer.remove_gateway("K1").unwrap();
        assert_eq!(composer.list_gateway_names(), vec!["K2".to_string()]);
    }

    #[tokio::test]
    async fn dynamic_router_reflects_gateway_removal_without_restarting_the_listener() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};

        let (composer, _dir) = seeded_composer();
        composer.create_kit("K1", true).unwrap();
        composer.add_gateway("K1").unwrap();
        composer.create_kit("K2", true).unwrap();
        composer.add_gateway("K2").unwrap();

        let (k1_sse_path, _, _) = composer.gateway_info("K1").unwrap();

        // Grabbing the served router once, the way `main.rs` hands it to
        // `axum::serve`, before the gateway is ever removed.
        let served = composer.dynamic_router();

        composer.remove_gateway("K1").unwrap();

        let response = served
            .oneshot(Request::builder().uri(&k1_sse_path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn assigning_unknown_server_fails_not_found() {
        let (composer, _dir) = seeded_composer();
        composer.create_kit("K", true).unwrap();
        let result = tokio_test_block_on(composer.assign_server_to_kit("K", "missing", true));
        assert!(matches!(result, Err(ComposerError::NotFound(_))));
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
